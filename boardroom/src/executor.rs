//! Round execution — per-persona fan-out with bounded concurrency.
//!
//! One round spawns one turn per active persona into a JoinSet, guarded by
//! a semaphore so at most `max_parallel_turns` model calls are in flight.
//! Contributions are collected in completion order. A session kill cancels
//! all outstanding turns; partial results from a killed round are discarded.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::error::{DeliberationFault, EngineError, EngineResult};
use crate::model::{ModelRequest, SharedModelClient};
use crate::parsers::structured::extract_structured;
use crate::persona::PersonaProfile;
use crate::rate_limit::RateLimiter;
use crate::state::{ContributionMessage, ContributionSummary, DeliberationState, SessionPhase};

/// Parameters for one round of turns.
#[derive(Debug, Clone, Copy)]
pub struct RoundPlan {
    pub round: u32,
    pub phase: SessionPhase,
    /// Temperature delta from the facilitator's stage schedule, applied on
    /// top of each persona's own temperature.
    pub temperature_adjustment: f32,
}

/// Outcome of one round: surviving turns plus per-persona failures.
#[derive(Debug)]
pub struct RoundResult {
    /// Contributions in completion order.
    pub contributions: Vec<ContributionMessage>,
    /// Personas whose turn failed after retries, with the failure message.
    pub failures: Vec<(String, String)>,
}

pub struct TurnExecutor {
    client: SharedModelClient,
    limiter: Arc<RateLimiter>,
    config: SessionConfig,
    model: String,
}

impl TurnExecutor {
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

    /// Run one round: a turn per persona, at most `max_parallel_turns`
    /// concurrent. Individual turn failures are recorded and the round
    /// continues; cancellation discards everything and returns `Killed`.
    pub async fn run_round(
        &self,
        state: &DeliberationState,
        plan: RoundPlan,
        cancel: &CancellationToken,
    ) -> EngineResult<RoundResult> {
        let sem = Arc::new(Semaphore::new(self.config.max_parallel_turns));
        let transcript = Arc::new(self.transcript(state));
        let problem = Arc::new(state.problem.clone());
        let mut join_set: JoinSet<Result<ContributionMessage, (String, String)>> = JoinSet::new();

        for persona in &state.personas {
            let sem = Arc::clone(&sem);
            let transcript = Arc::clone(&transcript);
            let problem = Arc::clone(&problem);
            let client = Arc::clone(&self.client);
            let limiter = Arc::clone(&self.limiter);
            let persona = persona.clone();
            let model = self.model.clone();
            let max_tokens = self.config.max_tokens;
            let base_temperature = self.config.base_temperature;
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let _permit = sem
                    .acquire()
                    .await
                    .map_err(|_| (persona.code.clone(), "semaphore closed".to_string()))?;

                let turn = run_turn(
                    &client,
                    &limiter,
                    &persona,
                    &problem,
                    &transcript,
                    &model,
                    plan,
                    max_tokens,
                    base_temperature,
                );
                tokio::select! {
                    result = turn => result.map_err(|e| (persona.code.clone(), e.to_string())),
                    _ = cancel.cancelled() => {
                        Err((persona.code.clone(), "cancelled".to_string()))
                    }
                }
            });
        }

        let mut contributions = Vec::new();
        let mut failures = Vec::new();

        loop {
            tokio::select! {
                next = join_set.join_next() => {
                    match next {
                        Some(Ok(Ok(contribution))) => {
                            debug!(
                                persona = %contribution.persona_code,
                                round = plan.round,
                                "turn complete"
                            );
                            contributions.push(contribution);
                        }
                        Some(Ok(Err((persona_code, message)))) => {
                            warn!(persona = %persona_code, error = %message, "turn failed");
                            failures.push((persona_code, message));
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "turn task panicked");
                            failures.push(("unknown".to_string(), e.to_string()));
                        }
                        None => break,
                    }
                }
                _ = cancel.cancelled() => {
                    join_set.abort_all();
                    return Err(EngineError::Deliberation(DeliberationFault::Killed {
                        reason: "session killed during round execution".to_string(),
                    }));
                }
            }
        }

        // A kill can surface as per-turn "cancelled" failures through
        // join_next before the cancelled branch above fires.
        if cancel.is_cancelled() {
            return Err(EngineError::Deliberation(DeliberationFault::Killed {
                reason: "session killed during round execution".to_string(),
            }));
        }

        if contributions.is_empty() && !failures.is_empty() {
            return Err(EngineError::external(
                self.client.provider_name(),
                format!("every persona turn failed in round {}", plan.round),
            ));
        }

        Ok(RoundResult {
            contributions,
            failures,
        })
    }

    /// Prior contributions rendered for the round's prompts.
    fn transcript(&self, state: &DeliberationState) -> String {
        state
            .history
            .iter()
            .map(|c| format!("[round {}] {}: {}", c.round, c.persona_code, c.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn system_prompt(persona: &PersonaProfile) -> String {
    format!(
        "You are {}, a board member with a {} perspective. Traits: {}. \
        Argue from your expertise, challenge weak reasoning from other members, \
        and stay concrete. End with a JSON object: \
        {{\"concise\": \"...\", \"concerns\": [], \"questions\": []}}.",
        persona.display_name,
        persona.archetype,
        persona.traits.join(", ")
    )
}

fn user_prompt(problem: &str, transcript: &str, plan: RoundPlan) -> String {
    if transcript.is_empty() {
        format!(
            "Business problem:\n{problem}\n\nRound {}: give your opening position.",
            plan.round
        )
    } else {
        format!(
            "Business problem:\n{problem}\n\nDiscussion so far:\n{transcript}\n\n\
            Round {}: respond to the discussion. Add something new or challenge a point.",
            plan.round
        )
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_turn(
    client: &SharedModelClient,
    limiter: &RateLimiter,
    persona: &PersonaProfile,
    problem: &str,
    transcript: &str,
    model: &str,
    plan: RoundPlan,
    max_tokens: u32,
    base_temperature: f32,
) -> EngineResult<ContributionMessage> {
    let waited = limiter.acquire(1).await?;
    if waited > 0.0 {
        debug!(persona = %persona.code, waited_s = waited, "turn throttled");
    }

    let temperature = (persona.temperature.unwrap_or(base_temperature) + plan.temperature_adjustment)
        .clamp(0.0, 2.0);
    let request = ModelRequest::new(&system_prompt(persona), &user_prompt(problem, transcript, plan), model)
        .max_tokens(max_tokens)
        .temperature(temperature);

    let response = client.complete(&request).await?;
    let content = response.text()?.to_string();

    let mut contribution = ContributionMessage::new(&persona.code, plan.round, plan.phase, content);
    contribution.usage = response.usage;
    // A summary is best-effort; unparseable output just leaves it absent.
    contribution.summary = extract_structured::<ContributionSummary>(&contribution.content)
        .ok()
        .map(|(summary, _)| summary);
    Ok(contribution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::config::RateLimitConfig;
    use crate::model::{ModelClient, ModelResponse, ModelUsage};

    struct EchoClient {
        calls: AtomicU32,
        delay_ms: u64,
        fail_for: Option<String>,
    }

    impl EchoClient {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                delay_ms: 0,
                fail_for: None,
            }
        }
    }

    #[async_trait]
    impl ModelClient for EchoClient {
        async fn complete(&self, request: &ModelRequest) -> EngineResult<ModelResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if let Some(marker) = &self.fail_for {
                if request.system_prompt.contains(marker.as_str()) {
                    return Err(EngineError::external("echo", "turn failed"));
                }
            }
            Ok(ModelResponse {
                success: true,
                content: Some(format!("reply to: {}", request.messages[0].content.len())),
                usage: ModelUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    cost: 0.001,
                },
            })
        }

        fn provider_name(&self) -> &str {
            "echo"
        }
    }

    fn executor(client: EchoClient) -> TurnExecutor {
        TurnExecutor::new(
            Arc::new(client),
            Arc::new(RateLimiter::new("model", RateLimitConfig::new(1000, 1.0)).unwrap()),
            SessionConfig::default(),
            "test-model",
        )
    }

    fn state_with_panel(panel_size: usize) -> DeliberationState {
        let mut state = DeliberationState::new("s-1", "Should we expand?");
        state.personas = crate::persona::PersonaCatalog::builtin()
            .select_panel("Should we expand?", panel_size);
        state
    }

    fn plan(round: u32) -> RoundPlan {
        RoundPlan {
            round,
            phase: SessionPhase::Deliberation,
            temperature_adjustment: 0.0,
        }
    }

    #[tokio::test]
    async fn test_one_contribution_per_persona() {
        let exec = executor(EchoClient::new());
        let state = state_with_panel(4);
        let cancel = CancellationToken::new();

        let result = exec.run_round(&state, plan(1), &cancel).await.unwrap();
        assert_eq!(result.contributions.len(), 4);
        assert!(result.failures.is_empty());

        let mut codes: Vec<&str> = result
            .contributions
            .iter()
            .map(|c| c.persona_code.as_str())
            .collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), 4);
    }

    #[tokio::test]
    async fn test_failed_turn_recorded_round_continues() {
        let exec = executor(EchoClient {
            calls: AtomicU32::new(0),
            delay_ms: 0,
            fail_for: Some("The CFO".to_string()),
        });
        let state = state_with_panel(3);
        let cancel = CancellationToken::new();

        let result = exec.run_round(&state, plan(1), &cancel).await.unwrap();
        assert_eq!(result.contributions.len() + result.failures.len(), 3);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].0, "cfo");
    }

    #[tokio::test]
    async fn test_all_turns_failing_is_external_error() {
        let exec = executor(EchoClient {
            calls: AtomicU32::new(0),
            delay_ms: 0,
            fail_for: Some("board member".to_string()),
        });
        let state = state_with_panel(3);
        let cancel = CancellationToken::new();

        let err = exec.run_round(&state, plan(1), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), "external_service");
    }

    struct TemperatureRecorder {
        temperatures: std::sync::Mutex<Vec<f32>>,
    }

    #[async_trait]
    impl ModelClient for TemperatureRecorder {
        async fn complete(&self, request: &ModelRequest) -> EngineResult<ModelResponse> {
            self.temperatures
                .lock()
                .unwrap()
                .push(request.temperature);
            Ok(ModelResponse {
                success: true,
                content: Some("noted".to_string()),
                usage: ModelUsage::default(),
            })
        }

        fn provider_name(&self) -> &str {
            "recorder"
        }
    }

    #[tokio::test]
    async fn test_persona_without_temperature_inherits_session_base() {
        let client = Arc::new(TemperatureRecorder {
            temperatures: std::sync::Mutex::new(Vec::new()),
        });
        let config = SessionConfig {
            base_temperature: 1.3,
            ..Default::default()
        };
        let exec = TurnExecutor::new(
            Arc::clone(&client) as SharedModelClient,
            Arc::new(RateLimiter::new("model", RateLimitConfig::new(1000, 1.0)).unwrap()),
            config,
            "test-model",
        );

        let mut state = DeliberationState::new("s-1", "Should we expand?");
        let mut inherits = crate::persona::PersonaCatalog::builtin()
            .get("cfo")
            .unwrap()
            .clone();
        inherits.temperature = None;
        state.personas = vec![inherits];
        let cancel = CancellationToken::new();

        exec.run_round(&state, plan(1), &cancel).await.unwrap();
        let recorded = client.temperatures.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert!((recorded[0] - 1.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_persona_temperature_overrides_session_base() {
        let client = Arc::new(TemperatureRecorder {
            temperatures: std::sync::Mutex::new(Vec::new()),
        });
        let config = SessionConfig {
            base_temperature: 1.3,
            ..Default::default()
        };
        let exec = TurnExecutor::new(
            Arc::clone(&client) as SharedModelClient,
            Arc::new(RateLimiter::new("model", RateLimitConfig::new(1000, 1.0)).unwrap()),
            config,
            "test-model",
        );

        let mut state = DeliberationState::new("s-1", "Should we expand?");
        state.personas = vec![crate::persona::PersonaCatalog::builtin()
            .get("cfo")
            .unwrap()
            .clone()];
        let cancel = CancellationToken::new();

        exec.run_round(&state, plan(1), &cancel).await.unwrap();
        let recorded = client.temperatures.lock().unwrap();
        assert!((recorded[0] - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_kill_discards_partial_round() {
        let exec = executor(EchoClient {
            calls: AtomicU32::new(0),
            delay_ms: 5_000,
            fail_for: None,
        });
        let state = state_with_panel(3);
        let cancel = CancellationToken::new();

        let killer = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            killer.cancel();
        });

        let err = exec.run_round(&state, plan(1), &cancel).await.unwrap_err();
        match err {
            EngineError::Deliberation(DeliberationFault::Killed { .. }) => {}
            other => panic!("expected killed, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_kill_before_round_is_killed_not_external() {
        // Every turn observes the cancel itself and reports "cancelled";
        // the round must still end as killed, not as a provider failure.
        let exec = executor(EchoClient {
            calls: AtomicU32::new(0),
            delay_ms: 5_000,
            fail_for: None,
        });
        let state = state_with_panel(3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = exec.run_round(&state, plan(1), &cancel).await.unwrap_err();
        match err {
            EngineError::Deliberation(DeliberationFault::Killed { .. }) => {}
            other => panic!("expected killed, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_usage_carried_onto_contribution() {
        let exec = executor(EchoClient::new());
        let state = state_with_panel(2);
        let cancel = CancellationToken::new();

        let result = exec.run_round(&state, plan(1), &cancel).await.unwrap();
        for c in &result.contributions {
            assert_eq!(c.usage.input_tokens, 10);
            assert!((c.usage.cost - 0.001).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_round_metadata_on_contributions() {
        let exec = executor(EchoClient::new());
        let state = state_with_panel(2);
        let cancel = CancellationToken::new();

        let result = exec.run_round(&state, plan(3), &cancel).await.unwrap();
        for c in &result.contributions {
            assert_eq!(c.round, 3);
            assert_eq!(c.phase, SessionPhase::Deliberation);
        }
    }
}
