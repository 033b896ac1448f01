//! Deliberation event envelopes.
//!
//! Every significant occurrence in a session produces one event. The
//! envelope is extensible: consumers may ignore fields they do not know.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{ContributionSummary, SessionPhase, SessionStatus};

/// All deliberation events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DeliberationEvent {
    /// A session started processing.
    SessionStarted {
        session_id: String,
        problem_preview: String,
        timestamp: DateTime<Utc>,
    },

    /// Problem decomposition produced the sub-problem list.
    DecompositionComplete {
        session_id: String,
        sub_problem_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// The panel for a sub-problem was selected.
    PanelSelected {
        session_id: String,
        sub_problem_index: usize,
        persona_codes: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// A round of contributions began.
    RoundStarted {
        session_id: String,
        sub_problem_index: usize,
        round: u32,
        phase: SessionPhase,
        timestamp: DateTime<Utc>,
    },

    /// A persona produced a contribution that survived dedup.
    Contribution {
        session_id: String,
        sub_problem_index: usize,
        persona_code: String,
        persona_name: String,
        content: String,
        round: u32,
        #[serde(default)]
        summary: Option<ContributionSummary>,
        timestamp: DateTime<Utc>,
    },

    /// A contribution was dropped as a near-duplicate.
    DuplicateFiltered {
        session_id: String,
        sub_problem_index: usize,
        persona_code: String,
        round: u32,
        similarity: f64,
        timestamp: DateTime<Utc>,
    },

    /// A session or sub-problem changed phase.
    PhaseChanged {
        session_id: String,
        sub_problem_index: Option<usize>,
        from: SessionPhase,
        to: SessionPhase,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A persona's vote was recorded.
    VoteRecorded {
        session_id: String,
        sub_problem_index: usize,
        persona_code: String,
        decision: String,
        confidence: f64,
        timestamp: DateTime<Utc>,
    },

    /// A sub-problem finished its full pipeline with a synthesis result.
    SubproblemComplete {
        session_id: String,
        sub_problem_index: usize,
        result_preview: String,
        timestamp: DateTime<Utc>,
    },

    /// Meta-synthesis across all sub-problem results finished.
    MetaSynthesisComplete {
        session_id: String,
        result_preview: String,
        timestamp: DateTime<Utc>,
    },

    /// The session reached a terminal state.
    SessionEnded {
        session_id: String,
        status: SessionStatus,
        total_cost: f64,
        timestamp: DateTime<Utc>,
    },

    /// An error occurred during deliberation.
    Error {
        session_id: String,
        sub_problem_index: Option<usize>,
        kind: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl DeliberationEvent {
    /// Get the timestamp of this event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::SessionStarted { timestamp, .. } => *timestamp,
            Self::DecompositionComplete { timestamp, .. } => *timestamp,
            Self::PanelSelected { timestamp, .. } => *timestamp,
            Self::RoundStarted { timestamp, .. } => *timestamp,
            Self::Contribution { timestamp, .. } => *timestamp,
            Self::DuplicateFiltered { timestamp, .. } => *timestamp,
            Self::PhaseChanged { timestamp, .. } => *timestamp,
            Self::VoteRecorded { timestamp, .. } => *timestamp,
            Self::SubproblemComplete { timestamp, .. } => *timestamp,
            Self::MetaSynthesisComplete { timestamp, .. } => *timestamp,
            Self::SessionEnded { timestamp, .. } => *timestamp,
            Self::Error { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as its registered string.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::DecompositionComplete { .. } => "decomposition_complete",
            Self::PanelSelected { .. } => "panel_selected",
            Self::RoundStarted { .. } => "round_started",
            Self::Contribution { .. } => "contribution",
            Self::DuplicateFiltered { .. } => "duplicate_filtered",
            Self::PhaseChanged { .. } => "phase_changed",
            Self::VoteRecorded { .. } => "vote_recorded",
            Self::SubproblemComplete { .. } => "subproblem_complete",
            Self::MetaSynthesisComplete { .. } => "meta_synthesis_complete",
            Self::SessionEnded { .. } => "session_ended",
            Self::Error { .. } => "error",
        }
    }

    /// Get the session this event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionStarted { session_id, .. } => session_id,
            Self::DecompositionComplete { session_id, .. } => session_id,
            Self::PanelSelected { session_id, .. } => session_id,
            Self::RoundStarted { session_id, .. } => session_id,
            Self::Contribution { session_id, .. } => session_id,
            Self::DuplicateFiltered { session_id, .. } => session_id,
            Self::PhaseChanged { session_id, .. } => session_id,
            Self::VoteRecorded { session_id, .. } => session_id,
            Self::SubproblemComplete { session_id, .. } => session_id,
            Self::MetaSynthesisComplete { session_id, .. } => session_id,
            Self::SessionEnded { session_id, .. } => session_id,
            Self::Error { session_id, .. } => session_id,
        }
    }

    /// Get the sub-problem index if this event is sub-problem-scoped.
    pub fn sub_problem_index(&self) -> Option<usize> {
        match self {
            Self::PanelSelected { sub_problem_index, .. } => Some(*sub_problem_index),
            Self::RoundStarted { sub_problem_index, .. } => Some(*sub_problem_index),
            Self::Contribution { sub_problem_index, .. } => Some(*sub_problem_index),
            Self::DuplicateFiltered { sub_problem_index, .. } => Some(*sub_problem_index),
            Self::PhaseChanged { sub_problem_index, .. } => *sub_problem_index,
            Self::VoteRecorded { sub_problem_index, .. } => Some(*sub_problem_index),
            Self::SubproblemComplete { sub_problem_index, .. } => Some(*sub_problem_index),
            Self::Error { sub_problem_index, .. } => *sub_problem_index,
            _ => None,
        }
    }
}

/// Truncate long text for event previews.
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{truncated}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_matches_serde_tag() {
        let event = DeliberationEvent::MetaSynthesisComplete {
            session_id: "s-1".to_string(),
            result_preview: "answer".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], event.event_type());
        assert_eq!(event.event_type(), "meta_synthesis_complete");
    }

    #[test]
    fn test_session_id_accessor() {
        let event = DeliberationEvent::RoundStarted {
            session_id: "s-9".to_string(),
            sub_problem_index: 1,
            round: 3,
            phase: SessionPhase::Deliberation,
            timestamp: Utc::now(),
        };
        assert_eq!(event.session_id(), "s-9");
        assert_eq!(event.sub_problem_index(), Some(1));
    }

    #[test]
    fn test_session_scoped_events_have_no_index() {
        let event = DeliberationEvent::SessionStarted {
            session_id: "s-1".to_string(),
            problem_preview: "p".to_string(),
            timestamp: Utc::now(),
        };
        assert_eq!(event.sub_problem_index(), None);
    }

    #[test]
    fn test_serde_roundtrip() {
        let event = DeliberationEvent::Contribution {
            session_id: "s-1".to_string(),
            sub_problem_index: 0,
            persona_code: "cfo".to_string(),
            persona_name: "The CFO".to_string(),
            content: "We cannot afford this.".to_string(),
            round: 2,
            summary: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: DeliberationEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type(), "contribution");
    }

    #[test]
    fn test_preview_truncation() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("abcdefghij", 4), "abcd...");
    }
}
