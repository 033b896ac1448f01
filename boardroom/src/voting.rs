//! Vote collection and weighted aggregation.
//!
//! Each persona produces one recommendation during the voting phase. Model
//! output is parsed structurally when possible and degraded to the free-text
//! parsers otherwise; a vote is never lost to a parse failure.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{ModelRequest, ModelUsage, SharedModelClient};
use crate::parsers::conditions::parse_conditions;
use crate::parsers::confidence::parse_confidence;
use crate::parsers::structured::extract_structured;
use crate::parsers::vote::{parse_vote_decision, VoteDecision};
use crate::persona::PersonaProfile;
use crate::rate_limit::RateLimiter;
use crate::state::{DeliberationState, Recommendation};

/// Error type for voting operations.
#[derive(Debug, thiserror::Error)]
pub enum VotingError {
    #[error("no personas on the panel")]
    EmptyPanel,

    #[error("no recommendations collected: {0}")]
    NoRecommendations(String),
}

/// Structured payload a persona is asked to emit during voting.
#[derive(Debug, Deserialize)]
struct BallotPayload {
    recommendation: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    confidence: Option<serde_json::Value>,
    #[serde(default)]
    conditions: Vec<String>,
    #[serde(default)]
    decision: Option<String>,
}

/// Aggregated outcome of a voting phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotingSummary {
    pub recommendations: Vec<Recommendation>,
    /// Sum of panel weights that voted at all (abstentions excluded).
    pub participating_weight: f64,
    pub yes_weight: f64,
    pub no_weight: f64,
    pub conditional_weight: f64,
    pub abstain_weight: f64,
    /// Confidence-weighted mean over participating votes, in [0,1].
    pub weighted_confidence: f64,
    /// The panel's overall decision.
    pub decision: VoteDecision,
    /// All conditions attached by conditional voters, in vote order.
    pub conditions: Vec<String>,
    /// Token/cost accounting for the voting calls.
    #[serde(default)]
    pub usage: ModelUsage,
}

impl VotingSummary {
    /// Whether the panel leans toward acting.
    pub fn approves(&self) -> bool {
        matches!(self.decision, VoteDecision::Yes | VoteDecision::Conditional)
    }
}

/// Collects recommendations from the panel and aggregates them.
pub struct VoteCollector {
    client: SharedModelClient,
    limiter: Arc<RateLimiter>,
    config: SessionConfig,
    model: String,
}

impl VoteCollector {
    pub fn new(
        client: SharedModelClient,
        limiter: Arc<RateLimiter>,
        config: SessionConfig,
        model: &str,
    ) -> Self {
        Self {
            client,
            limiter,
            config,
            model: model.to_string(),
        }
    }

    /// Ask every panel member for a recommendation and aggregate the votes.
    /// A persona whose model call fails is recorded as an abstention with a
    /// warning; voting only fails when no persona responds at all.
    pub async fn collect(&self, state: &DeliberationState) -> EngineResult<VotingSummary> {
        if state.personas.is_empty() {
            return Err(EngineError::Validation(VotingError::EmptyPanel.to_string()));
        }

        let mut recommendations = Vec::new();
        let mut usage = ModelUsage::default();
        let mut failures = 0usize;

        for persona in &state.personas {
            match self.collect_one(state, persona).await {
                Ok((rec, call_usage)) => {
                    usage.add(&call_usage);
                    debug!(
                        persona = %rec.persona_code,
                        decision = %rec.decision,
                        confidence = rec.confidence,
                        "vote collected"
                    );
                    recommendations.push(rec);
                }
                Err(e) => {
                    warn!(persona = %persona.code, error = %e, "vote collection failed, recording abstention");
                    failures += 1;
                    recommendations.push(Recommendation {
                        persona_code: persona.code.clone(),
                        recommendation: String::new(),
                        reasoning: format!("no response: {e}"),
                        confidence: 0.0,
                        conditions: Vec::new(),
                        decision: VoteDecision::Abstain,
                        weight: persona.default_weight,
                    });
                }
            }
        }

        if failures == state.personas.len() {
            return Err(EngineError::external(
                self.client.provider_name(),
                VotingError::NoRecommendations(format!("{failures} personas failed")).to_string(),
            ));
        }

        let mut summary = aggregate(recommendations);
        summary.usage = usage;
        info!(
            session_id = %state.session_id,
            decision = %summary.decision,
            weighted_confidence = summary.weighted_confidence,
            "voting complete"
        );
        Ok(summary)
    }

    async fn collect_one(
        &self,
        state: &DeliberationState,
        persona: &PersonaProfile,
    ) -> EngineResult<(Recommendation, ModelUsage)> {
        self.limiter.acquire(1).await?;

        let transcript = state
            .history
            .iter()
            .map(|c| format!("{}: {}", c.persona_code, c.content))
            .collect::<Vec<_>>()
            .join("\n");

        let system = format!(
            "You are {}. Deliberation is over; cast your final vote. \
            Respond with a JSON object: {{\"recommendation\": \"...\", \
            \"reasoning\": \"...\", \"decision\": \"yes|no|conditional|abstain\", \
            \"confidence\": 0.0, \"conditions\": []}}.",
            persona.display_name
        );
        let user = format!(
            "Problem:\n{}\n\nDeliberation transcript:\n{}\n\nYour final recommendation:",
            state.problem, transcript
        );

        let request = ModelRequest::new(&system, &user, &self.model)
            .max_tokens(self.config.max_tokens)
            .temperature(0.3)
            .prefill("{\"recommendation\":");

        let response = self.client.complete(&request).await?;
        let text = response.text()?;
        Ok((parse_recommendation(persona, text), response.usage))
    }
}

/// Parse one persona's voting output into a recommendation. The structured
/// path is tried first; on failure every field degrades through the
/// free-text parsers, so this never errors.
pub fn parse_recommendation(persona: &PersonaProfile, text: &str) -> Recommendation {
    if let Ok((ballot, strategy)) = extract_structured::<BallotPayload>(text) {
        debug!(persona = %persona.code, ?strategy, "ballot parsed structurally");
        let confidence = match &ballot.confidence {
            Some(serde_json::Value::Number(n)) => {
                let v = n.as_f64().unwrap_or(0.6);
                if v > 1.0 { (v / 100.0).clamp(0.0, 1.0) } else { v.clamp(0.0, 1.0) }
            }
            Some(serde_json::Value::String(s)) => parse_confidence(s),
            _ => parse_confidence(text),
        };
        let decision = match &ballot.decision {
            Some(d) => parse_vote_decision(d),
            None => parse_vote_decision(&ballot.recommendation),
        };
        // Conditions imply a conditional vote even when the decision field
        // said plain yes.
        let decision = if decision == VoteDecision::Yes && !ballot.conditions.is_empty() {
            VoteDecision::Conditional
        } else {
            decision
        };
        return Recommendation {
            persona_code: persona.code.clone(),
            recommendation: ballot.recommendation,
            reasoning: ballot.reasoning,
            confidence,
            conditions: ballot.conditions,
            decision,
            weight: persona.default_weight,
        };
    }

    debug!(persona = %persona.code, "ballot fell back to free-text parsing");
    Recommendation {
        persona_code: persona.code.clone(),
        recommendation: text.trim().to_string(),
        reasoning: String::new(),
        confidence: parse_confidence(text),
        conditions: parse_conditions(text),
        decision: parse_vote_decision(text),
        weight: persona.default_weight,
    }
}

/// Weighted aggregation over the panel's recommendations.
pub fn aggregate(recommendations: Vec<Recommendation>) -> VotingSummary {
    let mut yes_weight = 0.0;
    let mut no_weight = 0.0;
    let mut conditional_weight = 0.0;
    let mut abstain_weight = 0.0;
    let mut confidence_sum = 0.0;
    let mut conditions = Vec::new();

    for rec in &recommendations {
        match rec.decision {
            VoteDecision::Yes => yes_weight += rec.weight,
            VoteDecision::No => no_weight += rec.weight,
            VoteDecision::Conditional => {
                conditional_weight += rec.weight;
                conditions.extend(rec.conditions.iter().cloned());
            }
            VoteDecision::Abstain => abstain_weight += rec.weight,
        }
        if rec.decision != VoteDecision::Abstain {
            confidence_sum += rec.confidence * rec.weight;
        }
    }

    let participating_weight = yes_weight + no_weight + conditional_weight;
    let weighted_confidence = if participating_weight > 0.0 {
        confidence_sum / participating_weight
    } else {
        0.0
    };

    let approving = yes_weight + conditional_weight;
    let decision = if participating_weight == 0.0 {
        VoteDecision::Abstain
    } else if no_weight >= approving {
        VoteDecision::No
    } else if conditional_weight > yes_weight {
        VoteDecision::Conditional
    } else {
        VoteDecision::Yes
    };

    VotingSummary {
        recommendations,
        participating_weight,
        yes_weight,
        no_weight,
        conditional_weight,
        abstain_weight,
        weighted_confidence,
        decision,
        conditions,
        usage: ModelUsage::default(),
    }
}
