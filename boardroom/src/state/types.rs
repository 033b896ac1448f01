//! Session tracking types — the records the orchestrator owns and mutates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ModelUsage;
use crate::parsers::vote::VoteDecision;
use crate::persona::PersonaProfile;
use crate::state::phase::{PhaseTransition, SessionPhase, TransitionError};

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Failed,
    Killed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Killed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// A decomposed piece of the original problem. Immutable after decomposition
/// except for its result summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubProblem {
    pub id: String,
    pub goal: String,
    pub context: String,
    /// Complexity score, 0 to 10.
    pub complexity: u8,
    /// Indices of sub-problems that must finish before this one starts.
    pub depends_on: Vec<usize>,
    pub constraints: Vec<String>,
    /// Synthesis result, set once the sub-problem's pipeline finishes.
    pub result: Option<String>,
}

impl SubProblem {
    pub fn new(goal: &str, context: &str, complexity: u8) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            goal: goal.to_string(),
            context: context.to_string(),
            complexity: complexity.min(10),
            depends_on: Vec::new(),
            constraints: Vec::new(),
            result: None,
        }
    }

    pub fn depends_on(mut self, indices: &[usize]) -> Self {
        self.depends_on = indices.to_vec();
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.result.is_some()
    }
}

/// Structured summary attached to a contribution when the model's output
/// yields one; absent when parsing fails.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContributionSummary {
    pub concise: String,
    #[serde(default)]
    pub looking_for: Option<String>,
    #[serde(default)]
    pub value_added: Option<String>,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default)]
    pub questions: Vec<String>,
}

/// One persona's output for one round. Append-only; never mutated after
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionMessage {
    pub persona_code: String,
    pub round: u32,
    pub phase: SessionPhase,
    pub content: String,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub summary: Option<ContributionSummary>,
    pub usage: ModelUsage,
    pub created_at: DateTime<Utc>,
}

impl ContributionMessage {
    pub fn new(persona_code: &str, round: u32, phase: SessionPhase, content: String) -> Self {
        Self {
            persona_code: persona_code.to_string(),
            round,
            phase,
            content,
            thinking: None,
            summary: None,
            usage: ModelUsage::default(),
            created_at: Utc::now(),
        }
    }
}

/// One persona's recommendation produced during the voting phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub persona_code: String,
    pub recommendation: String,
    pub reasoning: String,
    /// Confidence in [0.0, 1.0].
    pub confidence: f64,
    pub conditions: Vec<String>,
    pub decision: VoteDecision,
    pub weight: f64,
}

/// The mutable working state for one sub-problem's deliberation. Owned
/// exclusively by the orchestrator; the facilitator and executor read it
/// and return results, they never mutate it directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliberationState {
    pub session_id: String,
    pub problem: String,
    pub personas: Vec<PersonaProfile>,
    pub sub_problem_index: Option<usize>,
    /// Contribution history in completion order.
    pub history: Vec<ContributionMessage>,
    pub phase: SessionPhase,
    pub round_number: u32,
}

impl DeliberationState {
    pub fn new(session_id: &str, problem: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            problem: problem.to_string(),
            personas: Vec::new(),
            sub_problem_index: None,
            history: Vec::new(),
            phase: SessionPhase::ProblemDecomposition,
            round_number: 0,
        }
    }

    /// Contributions produced in a given round, in history order.
    pub fn round_contributions(&self, round: u32) -> Vec<&ContributionMessage> {
        self.history.iter().filter(|c| c.round == round).collect()
    }
}

/// A deliberation session from intake to terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub problem: String,
    /// Structured caller-supplied context.
    pub context: serde_json::Value,
    pub status: SessionStatus,
    pub phase: SessionPhase,
    pub round_number: u32,
    pub max_rounds: u32,
    /// Accumulated token and cost counters across all model calls.
    pub usage: ModelUsage,
    pub sub_problems: Vec<SubProblem>,
    pub transitions: Vec<PhaseTransition>,
    /// Human-readable reason recorded when the session fails or is killed.
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: &str, problem: &str, max_rounds: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            problem: problem.to_string(),
            context: serde_json::Value::Null,
            status: SessionStatus::Active,
            phase: SessionPhase::ProblemDecomposition,
            round_number: 0,
            max_rounds,
            usage: ModelUsage::default(),
            sub_problems: Vec::new(),
            transitions: Vec::new(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Transition to a new phase with a reason, recording the transition.
    /// Entering a round phase increments the round counter; entering a
    /// terminal phase updates the status to match.
    pub fn transition(&mut self, to: SessionPhase, reason: &str) -> Result<(), TransitionError> {
        if !self.phase.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.phase,
                to,
                reason: format!(
                    "not a valid transition (allowed: {:?})",
                    self.phase.valid_transitions()
                ),
            });
        }

        self.transitions.push(PhaseTransition {
            from: self.phase,
            to,
            timestamp: Utc::now(),
            reason: reason.to_string(),
        });
        self.phase = to;
        self.updated_at = Utc::now();

        if to.is_round_phase() {
            self.round_number += 1;
        }
        match to {
            SessionPhase::Completed => self.status = SessionStatus::Completed,
            SessionPhase::Failed => {
                self.status = SessionStatus::Failed;
                self.failure_reason = Some(reason.to_string());
            }
            SessionPhase::Killed => {
                self.status = SessionStatus::Killed;
                self.failure_reason = Some(reason.to_string());
            }
            _ => {}
        }

        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn has_rounds_remaining(&self) -> bool {
        self.round_number < self.max_rounds
    }

    /// Compact status line for logs.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] round {}/{} | {} sub-problems | status={}",
            self.phase,
            self.round_number,
            self.max_rounds,
            self.sub_problems.len(),
            self.status
        )
    }
}
