//! Facilitation guardrails — convergence, loop detection, and the round
//! temperature schedule.
//!
//! The facilitator never mutates session state. The orchestrator reports each
//! round's novelty rate and acts on the verdict.

use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;

/// Rounds that must elapse before a single converged round can end
/// deliberation. The loop detector still fires earlier when consecutive
/// rounds stall.
const MIN_ROUNDS_BEFORE_CONVERGENCE: u32 = 3;

/// Where a round falls within the session's round budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStage {
    /// Round 1: opening positions.
    Initial,
    /// First 40% of the budget: divergent challenge.
    Early,
    Middle,
    /// Past 70% of the budget: drive toward convergence.
    Late,
}

impl RoundStage {
    pub fn classify(round: u32, max_rounds: u32) -> Self {
        if round <= 1 {
            return Self::Initial;
        }
        let progress = round as f64 / max_rounds.max(1) as f64;
        if progress <= 0.4 {
            Self::Early
        } else if progress > 0.7 {
            Self::Late
        } else {
            Self::Middle
        }
    }

    /// Temperature delta applied on top of the session's base temperature.
    pub fn temperature_adjustment(self) -> f32 {
        match self {
            Self::Initial | Self::Middle => 0.0,
            Self::Early => 0.15,
            Self::Late => -0.10,
        }
    }
}

impl std::fmt::Display for RoundStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Early => write!(f, "early"),
            Self::Middle => write!(f, "middle"),
            Self::Late => write!(f, "late"),
        }
    }
}

/// Verdict after a round of contributions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoundVerdict {
    /// Keep deliberating.
    Continue,
    /// Novelty dropped below the convergence threshold.
    Converged { novelty_rate: f64 },
    /// Round budget exhausted; voting is forced regardless of convergence.
    MaxRoundsReached { rounds: u32 },
    /// Consecutive stalled rounds; voting is forced early.
    LoopDetected { stalled_rounds: u32 },
}

impl RoundVerdict {
    /// Whether deliberation should stop and move to voting.
    pub fn should_vote(&self) -> bool {
        !matches!(self, Self::Continue)
    }

    /// Reason string recorded on the phase transition.
    pub fn reason(&self) -> String {
        match self {
            Self::Continue => "continue".to_string(),
            Self::Converged { novelty_rate } => {
                format!("converged (novelty rate {novelty_rate:.2})")
            }
            Self::MaxRoundsReached { rounds } => {
                format!("max rounds reached ({rounds})")
            }
            Self::LoopDetected { stalled_rounds } => {
                format!("loop detected ({stalled_rounds} stalled rounds)")
            }
        }
    }
}

/// Evaluates round outcomes against the session's deliberation budget.
pub struct Facilitator {
    config: SessionConfig,
    stalled_rounds: u32,
}

impl Facilitator {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            stalled_rounds: 0,
        }
    }

    /// Evaluate a completed round. `novelty_rate` is the fraction of the
    /// round's contributions that survived dedup filtering.
    ///
    /// Check order: round budget, then the stall counter, then single-round
    /// convergence. The budget check fires exactly at `max_rounds`, never
    /// beyond, even when convergence never triggers.
    pub fn evaluate_round(&mut self, round_number: u32, novelty_rate: f64) -> RoundVerdict {
        if novelty_rate <= self.config.convergence_novelty_rate {
            self.stalled_rounds += 1;
        } else {
            self.stalled_rounds = 0;
        }

        if round_number >= self.config.max_rounds {
            return RoundVerdict::MaxRoundsReached {
                rounds: round_number,
            };
        }

        if self.stalled_rounds >= self.config.max_stalled_rounds {
            return RoundVerdict::LoopDetected {
                stalled_rounds: self.stalled_rounds,
            };
        }

        if round_number >= MIN_ROUNDS_BEFORE_CONVERGENCE
            && novelty_rate <= self.config.convergence_novelty_rate
        {
            return RoundVerdict::Converged { novelty_rate };
        }

        RoundVerdict::Continue
    }

    /// Generation temperature for a round: the persona's or session's base,
    /// shifted by the round stage, clamped to the valid range.
    pub fn temperature_for_round(&self, base: f32, round_number: u32) -> f32 {
        let stage = RoundStage::classify(round_number, self.config.max_rounds);
        (base + stage.temperature_adjustment()).clamp(0.0, 2.0)
    }

    /// Reset per-sub-problem counters before a new deliberation pipeline.
    pub fn reset(&mut self) {
        self.stalled_rounds = 0;
    }

    pub fn stalled_rounds(&self) -> u32 {
        self.stalled_rounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facilitator(max_rounds: u32, max_stalled: u32) -> Facilitator {
        Facilitator::new(SessionConfig {
            max_rounds,
            max_stalled_rounds: max_stalled,
            convergence_novelty_rate: 0.34,
            ..Default::default()
        })
    }

    #[test]
    fn test_high_novelty_continues() {
        let mut fac = facilitator(10, 2);
        assert_eq!(fac.evaluate_round(1, 1.0), RoundVerdict::Continue);
        assert_eq!(fac.evaluate_round(2, 0.8), RoundVerdict::Continue);
        assert_eq!(fac.stalled_rounds(), 0);
    }

    #[test]
    fn test_voting_forced_exactly_at_max_rounds() {
        let mut fac = facilitator(10, 99);
        for round in 1..10 {
            assert_eq!(
                fac.evaluate_round(round, 1.0),
                RoundVerdict::Continue,
                "round {round}"
            );
        }
        assert_eq!(
            fac.evaluate_round(10, 1.0),
            RoundVerdict::MaxRoundsReached { rounds: 10 }
        );
    }

    #[test]
    fn test_loop_detection_on_consecutive_stalls() {
        let mut fac = facilitator(10, 2);
        assert_eq!(fac.evaluate_round(1, 0.2), RoundVerdict::Continue);
        assert_eq!(
            fac.evaluate_round(2, 0.1),
            RoundVerdict::LoopDetected { stalled_rounds: 2 }
        );
    }

    #[test]
    fn test_novel_round_resets_stall_counter() {
        let mut fac = facilitator(10, 2);
        fac.evaluate_round(1, 0.2);
        assert_eq!(fac.stalled_rounds(), 1);
        fac.evaluate_round(2, 0.9);
        assert_eq!(fac.stalled_rounds(), 0);
    }

    #[test]
    fn test_single_converged_round_after_minimum() {
        let mut fac = facilitator(10, 3);
        fac.evaluate_round(1, 1.0);
        fac.evaluate_round(2, 0.9);
        let verdict = fac.evaluate_round(3, 0.25);
        assert_eq!(verdict, RoundVerdict::Converged { novelty_rate: 0.25 });
        assert!(verdict.should_vote());
    }

    #[test]
    fn test_no_convergence_before_minimum_rounds() {
        let mut fac = facilitator(10, 3);
        assert_eq!(fac.evaluate_round(1, 0.0), RoundVerdict::Continue);
        fac.reset();
        assert_eq!(fac.evaluate_round(2, 0.0), RoundVerdict::Continue);
    }

    #[test]
    fn test_max_rounds_takes_priority_over_loop() {
        let mut fac = facilitator(2, 1);
        assert_eq!(
            fac.evaluate_round(2, 0.0),
            RoundVerdict::MaxRoundsReached { rounds: 2 }
        );
    }

    #[test]
    fn test_round_stage_classification() {
        assert_eq!(RoundStage::classify(1, 10), RoundStage::Initial);
        assert_eq!(RoundStage::classify(2, 10), RoundStage::Early);
        assert_eq!(RoundStage::classify(4, 10), RoundStage::Early);
        assert_eq!(RoundStage::classify(5, 10), RoundStage::Middle);
        assert_eq!(RoundStage::classify(7, 10), RoundStage::Middle);
        assert_eq!(RoundStage::classify(8, 10), RoundStage::Late);
    }

    #[test]
    fn test_temperature_schedule() {
        let fac = facilitator(10, 2);
        // Initial: no adjustment.
        assert!((fac.temperature_for_round(0.7, 1) - 0.7).abs() < 1e-6);
        // Early: +0.15.
        assert!((fac.temperature_for_round(0.7, 3) - 0.85).abs() < 1e-6);
        // Middle: no adjustment.
        assert!((fac.temperature_for_round(0.7, 6) - 0.7).abs() < 1e-6);
        // Late: -0.10.
        assert!((fac.temperature_for_round(0.7, 9) - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_temperature_clamped() {
        let fac = facilitator(10, 2);
        assert_eq!(fac.temperature_for_round(0.05, 9), 0.0);
        assert_eq!(fac.temperature_for_round(1.95, 3), 2.0);
    }

    #[test]
    fn test_verdict_reason_strings() {
        assert!(RoundVerdict::MaxRoundsReached { rounds: 10 }
            .reason()
            .contains("max rounds"));
        assert!(RoundVerdict::LoopDetected { stalled_rounds: 2 }
            .reason()
            .contains("loop"));
    }
}
