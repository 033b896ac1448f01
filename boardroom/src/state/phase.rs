//! Deliberation phase machine — phases, valid transitions, and the audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase of a deliberation session (or of one sub-problem's pipeline).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Breaking the problem into sub-problems.
    ProblemDecomposition,
    /// Choosing the panel for this problem.
    PersonaSelection,
    /// Round 1: each persona's opening position.
    InitialRound,
    /// Rounds 2..N of structured argument.
    Deliberation,
    /// Collecting recommendations and votes.
    Voting,
    /// Producing the sub-problem's final answer.
    Synthesis,
    /// Combining sub-problem results into one answer.
    MetaSynthesis,
    /// Session finished successfully.
    Completed,
    /// Session ended with a recorded failure reason.
    Failed,
    /// Session cancelled by an external kill signal.
    Killed,
}

impl SessionPhase {
    /// Whether this is a terminal phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Killed)
    }

    /// Whether the session is mid-round (contributions are being produced).
    pub fn is_round_phase(self) -> bool {
        matches!(self, Self::InitialRound | Self::Deliberation)
    }

    /// Valid transitions from this phase. Every non-terminal phase may fail
    /// or be killed.
    pub fn valid_transitions(self) -> &'static [SessionPhase] {
        match self {
            Self::ProblemDecomposition => &[Self::PersonaSelection, Self::Failed, Self::Killed],
            Self::PersonaSelection => &[Self::InitialRound, Self::Failed, Self::Killed],
            Self::InitialRound => &[
                Self::Deliberation,
                Self::Voting,
                Self::Failed,
                Self::Killed,
            ],
            Self::Deliberation => &[
                Self::Deliberation,
                Self::Voting,
                Self::Failed,
                Self::Killed,
            ],
            Self::Voting => &[Self::Synthesis, Self::Failed, Self::Killed],
            Self::Synthesis => &[
                Self::MetaSynthesis,
                Self::Completed,
                Self::Failed,
                Self::Killed,
            ],
            Self::MetaSynthesis => &[Self::Completed, Self::Failed, Self::Killed],
            Self::Completed | Self::Failed | Self::Killed => &[],
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProblemDecomposition => write!(f, "problem_decomposition"),
            Self::PersonaSelection => write!(f, "persona_selection"),
            Self::InitialRound => write!(f, "initial_round"),
            Self::Deliberation => write!(f, "deliberation"),
            Self::Voting => write!(f, "voting"),
            Self::Synthesis => write!(f, "synthesis"),
            Self::MetaSynthesis => write!(f, "meta_synthesis"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// A phase transition record kept on the session for auditing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: SessionPhase,
    pub to: SessionPhase,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Error for invalid phase transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: SessionPhase,
    pub to: SessionPhase,
    pub reason: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} -> {}: {}",
            self.from, self.to, self.reason
        )
    }
}

impl std::error::Error for TransitionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_phases() {
        assert!(SessionPhase::Completed.is_terminal());
        assert!(SessionPhase::Failed.is_terminal());
        assert!(SessionPhase::Killed.is_terminal());
        assert!(!SessionPhase::Voting.is_terminal());
        assert!(SessionPhase::Completed.valid_transitions().is_empty());
    }

    #[test]
    fn test_happy_path_transitions_allowed() {
        let path = [
            (SessionPhase::ProblemDecomposition, SessionPhase::PersonaSelection),
            (SessionPhase::PersonaSelection, SessionPhase::InitialRound),
            (SessionPhase::InitialRound, SessionPhase::Deliberation),
            (SessionPhase::Deliberation, SessionPhase::Voting),
            (SessionPhase::Voting, SessionPhase::Synthesis),
            (SessionPhase::Synthesis, SessionPhase::Completed),
        ];
        for (from, to) in path {
            assert!(from.valid_transitions().contains(&to), "{from} -> {to}");
        }
    }

    #[test]
    fn test_initial_round_may_skip_to_voting() {
        // Single-round convergence: no deliberation rounds needed.
        assert!(SessionPhase::InitialRound
            .valid_transitions()
            .contains(&SessionPhase::Voting));
    }

    #[test]
    fn test_synthesis_may_continue_to_meta() {
        assert!(SessionPhase::Synthesis
            .valid_transitions()
            .contains(&SessionPhase::MetaSynthesis));
    }

    #[test]
    fn test_no_backwards_transitions() {
        assert!(!SessionPhase::Voting
            .valid_transitions()
            .contains(&SessionPhase::Deliberation));
        assert!(!SessionPhase::Deliberation
            .valid_transitions()
            .contains(&SessionPhase::InitialRound));
    }

    #[test]
    fn test_every_nonterminal_phase_can_be_killed() {
        for phase in [
            SessionPhase::ProblemDecomposition,
            SessionPhase::PersonaSelection,
            SessionPhase::InitialRound,
            SessionPhase::Deliberation,
            SessionPhase::Voting,
            SessionPhase::Synthesis,
            SessionPhase::MetaSynthesis,
        ] {
            assert!(phase.valid_transitions().contains(&SessionPhase::Killed));
            assert!(phase.valid_transitions().contains(&SessionPhase::Failed));
        }
    }

    #[test]
    fn test_display_snake_case() {
        assert_eq!(SessionPhase::MetaSynthesis.to_string(), "meta_synthesis");
        assert_eq!(
            SessionPhase::ProblemDecomposition.to_string(),
            "problem_decomposition"
        );
    }

    #[test]
    fn test_serde_matches_display() {
        let json = serde_json::to_string(&SessionPhase::InitialRound).unwrap();
        assert_eq!(json, "\"initial_round\"");
    }
}
