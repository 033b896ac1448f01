//! Closed error taxonomy for the deliberation engine.
//!
//! Callers pattern-match on variants instead of downcasting: every component
//! error converts into [`EngineError`], and session-scoped failures carry a
//! [`DeliberationFault`] so one sick session can be ended without touching
//! the rest of the process.

use serde::{Deserialize, Serialize};

/// Result alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Top-level error kinds.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Missing or invalid required settings. Fatal for the affected
    /// orchestrator; surfaced at construction, never mid-session.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A model, embedding, or research API failed. Recoverable — the caller
    /// retries or falls back.
    #[error("external service error ({service}): {message}")]
    ExternalService { service: String, message: String },

    /// Malformed input handed to a component. Surfaced to the caller,
    /// never silently coerced.
    #[error("validation error: {0}")]
    Validation(String),

    /// Session/state-specific failure. Terminates the affected session
    /// gracefully.
    #[error("deliberation error: {0}")]
    Deliberation(#[from] DeliberationFault),

    /// Authentication/authorization failure from a collaborator. Out of core
    /// scope; carried so API-layer errors survive the boundary intact.
    #[error("auth error: {0}")]
    Auth(String),
}

impl EngineError {
    /// Short tag for logs and error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::ExternalService { .. } => "external_service",
            Self::Validation(_) => "validation",
            Self::Deliberation(_) => "deliberation",
            Self::Auth(_) => "auth",
        }
    }

    /// Whether retrying the same operation can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalService { .. })
    }

    /// Convenience constructor for external-service failures.
    pub fn external(service: &str, message: impl Into<String>) -> Self {
        Self::ExternalService {
            service: service.to_string(),
            message: message.into(),
        }
    }
}

/// Session-scoped failures. All of these end the session via a terminal
/// phase transition; none of them crash the orchestrator process.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum DeliberationFault {
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("operation {operation} invalid in phase {phase}")]
    InvalidPhase { operation: String, phase: String },

    #[error("session timed out after {elapsed_ms}ms (budget {budget_ms}ms)")]
    Timeout { elapsed_ms: u64, budget_ms: u64 },

    #[error("infinite loop detected: {stalled_rounds} consecutive low-novelty rounds")]
    InfiniteLoopDetected { stalled_rounds: u32 },

    #[error("cost limit exceeded: spent {spent:.4} of {limit:.4}")]
    CostLimitExceeded { spent: f64, limit: f64 },

    #[error("session killed: {reason}")]
    Killed { reason: String },
}

impl DeliberationFault {
    /// Faults that still produce a usable (if degraded) outcome: the
    /// safety valves force voting rather than discarding the session.
    pub fn forces_voting(&self) -> bool {
        matches!(self, Self::InfiniteLoopDetected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(EngineError::Configuration("x".into()).kind(), "configuration");
        assert_eq!(EngineError::external("brave", "503").kind(), "external_service");
        assert_eq!(EngineError::Validation("bad".into()).kind(), "validation");
        assert_eq!(EngineError::Auth("denied".into()).kind(), "auth");
    }

    #[test]
    fn test_retryable() {
        assert!(EngineError::external("openai", "timeout").is_retryable());
        assert!(!EngineError::Configuration("missing key".into()).is_retryable());
        assert!(!EngineError::Validation("bad input".into()).is_retryable());
    }

    #[test]
    fn test_fault_display() {
        let fault = DeliberationFault::InvalidPhase {
            operation: "submit_vote".into(),
            phase: "synthesis".into(),
        };
        assert!(fault.to_string().contains("submit_vote"));
        assert!(fault.to_string().contains("synthesis"));

        let fault = DeliberationFault::CostLimitExceeded {
            spent: 12.5,
            limit: 10.0,
        };
        assert!(fault.to_string().contains("12.5"));
    }

    #[test]
    fn test_fault_into_engine_error() {
        let err: EngineError = DeliberationFault::SessionNotFound {
            session_id: "s-1".into(),
        }
        .into();
        assert_eq!(err.kind(), "deliberation");
    }

    #[test]
    fn test_fault_serde_roundtrip() {
        let fault = DeliberationFault::InfiniteLoopDetected { stalled_rounds: 3 };
        let json = serde_json::to_string(&fault).unwrap();
        let parsed: DeliberationFault = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, fault);
        assert!(json.contains("infinite_loop_detected"));
    }

    #[test]
    fn test_forces_voting() {
        assert!(DeliberationFault::InfiniteLoopDetected { stalled_rounds: 2 }.forces_voting());
        assert!(!DeliberationFault::Killed {
            reason: "operator".into()
        }
        .forces_voting());
    }
}
