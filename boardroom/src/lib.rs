//! Boardroom deliberation engine.
//!
//! This library orchestrates multi-persona deliberation over a business
//! problem:
//! - Decomposition of the problem into dependency-ordered sub-problems
//! - A persona panel arguing over bounded rounds with duplicate filtering
//! - Facilitation that ends deliberation on convergence, stalling, or the
//!   round ceiling
//! - Weighted voting and synthesis, with meta-synthesis across sub-problems
//!
//! # Components
//!
//! ## Orchestration
//! - [`SessionOrchestrator`]: drives a session from intake to synthesis
//! - [`TurnExecutor`]: bounded-concurrency persona fan-out per round
//! - [`Facilitator`]: convergence, stall, and round-ceiling verdicts
//! - [`VoteCollector`]: vote collection and weighted aggregation
//!
//! ## Infrastructure
//! - [`RateLimiter`]: token-bucket throttling per external API
//! - [`SemanticDedup`]: near-duplicate filtering with graceful degradation
//! - [`EventBus`]: broadcast event stream with a bounded replay history
//! - [`ResourceRegistry`]: shared limiter and cache wiring
//!
//! ## Extension seams
//! - [`ModelClient`] / [`EmbeddingProvider`]: inference providers
//! - [`SessionStore`]: durable session persistence
//! - [`KeyValueStore`]: cache backends

pub mod cache;
pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod executor;
pub mod facilitator;
pub mod model;
pub mod orchestrator;
pub mod parsers;
pub mod persona;
pub mod rate_limit;
pub mod registry;
pub mod state;
pub mod voting;

// Re-export key orchestration types
pub use executor::{RoundPlan, RoundResult, TurnExecutor};
pub use facilitator::{Facilitator, RoundStage, RoundVerdict};
pub use orchestrator::{SessionOrchestrator, SessionReport};
pub use voting::{VoteCollector, VotingSummary};

// Re-export key state types
pub use state::{
    ContributionMessage, ContributionSummary, DeliberationState, MemorySessionStore,
    PhaseTransition, Recommendation, Session, SessionPhase, SessionStatus, SessionStore,
    SharedSessionStore, SubProblem,
};

// Re-export key event types
pub use events::{DeliberationEvent, EventBus, SharedEventBus};

// Re-export infrastructure types
pub use cache::{KeyValueStore, MemoryStore, ResponseCache, SharedKeyValueStore};
pub use config::{CacheConfig, RateLimitConfig, RetryPolicy, SessionConfig};
pub use dedup::{DedupConfig, NoveltyCheck, SemanticDedup, SimilarityMethod};
pub use error::{DeliberationFault, EngineError, EngineResult};
pub use model::{
    EmbeddingProvider, HttpModelClient, ModelClient, ModelRequest, ModelResponse, ModelUsage,
    RetryingClient, SharedEmbeddingProvider, SharedModelClient,
};
pub use persona::{Archetype, PersonaCatalog, PersonaProfile};
pub use rate_limit::RateLimiter;
pub use registry::ResourceRegistry;

// Re-export parser entry points
pub use parsers::comparison::{detect_comparison, DetectedComparison};
pub use parsers::conditions::parse_conditions;
pub use parsers::confidence::parse_confidence;
pub use parsers::structured::extract_structured;
pub use parsers::vote::{parse_vote_decision, VoteDecision};
