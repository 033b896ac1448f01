//! Parsers that turn unstructured model output into typed values.
//!
//! These never propagate errors to callers: a parsing failure degrades to a
//! safe default (medium confidence, empty condition list, abstain,
//! not-a-comparison). The structured extractor is the one exception — it
//! reports which strategies it attempted so total failures are diagnosable.

pub mod comparison;
pub mod conditions;
pub mod confidence;
pub mod structured;
pub mod vote;

pub use comparison::{detect_comparison, ComparisonType, DetectedComparison, ResearchQuestion};
pub use conditions::parse_conditions;
pub use confidence::parse_confidence;
pub use structured::{extract_structured, ParseStrategy, StructuredParseError};
pub use vote::{parse_vote_decision, VoteDecision};
