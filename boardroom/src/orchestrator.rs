//! Session orchestration — the top-level driver from problem intake to
//! synthesis.
//!
//! The orchestrator owns the session record and all mutations to it. Each
//! sub-problem runs its own pipeline (panel selection, rounds, voting,
//! synthesis) over a private [`DeliberationState`]; pipelines with no unmet
//! dependency run concurrently, and the session record is updated between
//! dependency waves. Every significant occurrence is published on the event
//! bus, and the session is persisted at phase boundaries.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::dedup::SemanticDedup;
use crate::error::{DeliberationFault, EngineError, EngineResult};
use crate::events::{preview, DeliberationEvent, SharedEventBus};
use crate::executor::{RoundPlan, TurnExecutor};
use crate::facilitator::{Facilitator, RoundStage};
use crate::model::{ModelRequest, ModelUsage, SharedModelClient};
use crate::parsers::comparison::detect_comparison;
use crate::parsers::structured::extract_structured;
use crate::persona::{PersonaCatalog, PersonaProfile};
use crate::rate_limit::RateLimiter;
use crate::registry::ResourceRegistry;
use crate::state::{
    ContributionMessage, DeliberationState, Session, SessionPhase, SharedSessionStore, SubProblem,
};
use crate::voting::{VoteCollector, VotingSummary};

const PREVIEW_CHARS: usize = 200;

/// Final outcome of a completed session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    /// The meta-synthesis for multi-sub-problem sessions, otherwise the
    /// single sub-problem's synthesis.
    pub final_answer: String,
    pub sub_problem_results: Vec<String>,
    pub usage: ModelUsage,
}

/// Shared cost ceiling across a session's concurrent pipelines.
struct CostMeter {
    limit: f64,
    spent: std::sync::Mutex<f64>,
}

impl CostMeter {
    fn new(limit: f64) -> Self {
        Self {
            limit,
            spent: std::sync::Mutex::new(0.0),
        }
    }

    /// Record spend; errors once the ceiling is crossed (0 = unlimited).
    fn add(&self, cost: f64) -> EngineResult<()> {
        let mut spent = self.spent.lock().unwrap_or_else(|e| e.into_inner());
        *spent += cost;
        if self.limit > 0.0 && *spent > self.limit {
            return Err(EngineError::Deliberation(
                DeliberationFault::CostLimitExceeded {
                    spent: *spent,
                    limit: self.limit,
                },
            ));
        }
        Ok(())
    }
}

/// What the decomposition model is asked to emit.
#[derive(Debug, Deserialize)]
struct DecompositionPayload {
    sub_problems: Vec<SubProblemPayload>,
}

#[derive(Debug, Deserialize)]
struct SubProblemPayload {
    goal: String,
    #[serde(default)]
    context: String,
    #[serde(default)]
    complexity: u8,
    #[serde(default)]
    depends_on: Vec<usize>,
    #[serde(default)]
    constraints: Vec<String>,
}

/// Everything a sub-problem pipeline needs, shareable across tasks.
struct PipelineCtx {
    client: SharedModelClient,
    limiter: Arc<RateLimiter>,
    dedup: Arc<SemanticDedup>,
    bus: SharedEventBus,
    config: SessionConfig,
    model: String,
    cancel: CancellationToken,
    cost: Arc<CostMeter>,
    session_id: String,
}

impl PipelineCtx {
    fn check_kill(&self) -> EngineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Deliberation(DeliberationFault::Killed {
                reason: "kill signal received".to_string(),
            }));
        }
        Ok(())
    }
}

struct PipelineOutcome {
    index: usize,
    result: String,
    summary: VotingSummary,
    rounds_used: u32,
    usage: ModelUsage,
}

pub struct SessionOrchestrator {
    client: SharedModelClient,
    catalog: PersonaCatalog,
    registry: Arc<ResourceRegistry>,
    dedup: Arc<SemanticDedup>,
    bus: SharedEventBus,
    store: SharedSessionStore,
    config: SessionConfig,
    model: String,
    cancel: CancellationToken,
}

impl SessionOrchestrator {
    pub fn new(
        client: SharedModelClient,
        catalog: PersonaCatalog,
        registry: Arc<ResourceRegistry>,
        dedup: Arc<SemanticDedup>,
        bus: SharedEventBus,
        store: SharedSessionStore,
        config: SessionConfig,
        model: &str,
    ) -> EngineResult<Self> {
        config.validate()?;
        if catalog.is_empty() {
            return Err(EngineError::Configuration(
                "persona catalog is empty".into(),
            ));
        }
        Ok(Self {
            client,
            catalog,
            registry,
            // The session config's threshold is authoritative for this
            // orchestrator's filtering.
            dedup: Arc::new(dedup.with_threshold(config.dedup_threshold)),
            bus,
            store,
            config,
            model: model.to_string(),
            cancel: CancellationToken::new(),
        })
    }

    /// Handle that cancels this session from outside. Cancelling discards
    /// the current round's partial work and ends the session as `killed`.
    pub fn kill_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one session end to end. A failure terminates this session
    /// gracefully — persisted with a reason, evented, never left mid-phase.
    pub async fn run(
        &self,
        user_id: &str,
        problem: &str,
        context: serde_json::Value,
    ) -> EngineResult<SessionReport> {
        let mut session = Session::new(user_id, problem, self.config.max_rounds);
        session.context = context;
        self.store.create(&session).await?;
        self.bus.publish(DeliberationEvent::SessionStarted {
            session_id: session.id.clone(),
            problem_preview: preview(problem, PREVIEW_CHARS),
            timestamp: Utc::now(),
        });
        info!(session_id = %session.id, "session started");

        match self.drive(&mut session).await {
            Ok(report) => {
                self.bus.publish(DeliberationEvent::SessionEnded {
                    session_id: session.id.clone(),
                    status: session.status,
                    total_cost: session.usage.cost,
                    timestamp: Utc::now(),
                });
                self.store.update(&session).await?;
                Ok(report)
            }
            Err(err) => {
                self.end_with_error(&mut session, &err).await;
                Err(err)
            }
        }
    }

    async fn drive(&self, session: &mut Session) -> EngineResult<SessionReport> {
        let limiter = self.registry.limiter(self.client.provider_name()).await?;

        // Phase 1: decomposition.
        let (sub_problems, decomposition_usage) = self.decompose(session).await?;
        session.usage.add(&decomposition_usage);
        session.sub_problems = sub_problems;
        self.bus.publish(DeliberationEvent::DecompositionComplete {
            session_id: session.id.clone(),
            sub_problem_count: session.sub_problems.len(),
            timestamp: Utc::now(),
        });
        self.transition(session, SessionPhase::PersonaSelection, "decomposition complete")?;
        self.store.update(session).await?;
        self.check_kill()?;

        // Phase 2: panel selection, once per session.
        let panel = self
            .catalog
            .select_panel(&session.problem, self.config.panel_size);
        if panel.is_empty() {
            return Err(EngineError::Validation("empty panel selected".into()));
        }
        self.transition(session, SessionPhase::InitialRound, "panel selected")?;
        self.store.update(session).await?;

        // Phases 3-6 per sub-problem, in dependency waves.
        let cost = Arc::new(CostMeter::new(self.config.cost_limit));
        cost.add(session.usage.cost)?;
        let ctx = Arc::new(PipelineCtx {
            client: Arc::clone(&self.client),
            limiter,
            dedup: Arc::clone(&self.dedup),
            bus: Arc::clone(&self.bus),
            config: self.config.clone(),
            model: self.model.clone(),
            cancel: self.cancel.clone(),
            cost,
            session_id: session.id.clone(),
        });

        let mut results: Vec<Option<String>> = vec![None; session.sub_problems.len()];
        let mut rounds_used_max = 1u32;
        let mut pending: Vec<usize> = (0..session.sub_problems.len()).collect();

        while !pending.is_empty() {
            self.check_kill()?;
            let ready: Vec<usize> = pending
                .iter()
                .copied()
                .filter(|&i| {
                    session.sub_problems[i]
                        .depends_on
                        .iter()
                        .all(|&d| results.get(d).map(|r| r.is_some()).unwrap_or(false))
                })
                .collect();
            if ready.is_empty() {
                return Err(EngineError::Validation(
                    "sub-problem dependencies form a cycle or reference missing results".into(),
                ));
            }

            let mut join_set: JoinSet<EngineResult<PipelineOutcome>> = JoinSet::new();
            for &index in &ready {
                let ctx = Arc::clone(&ctx);
                let sub = session.sub_problems[index].clone();
                let panel = panel.clone();
                join_set.spawn(async move { run_pipeline(ctx, index, sub, panel).await });
            }

            while let Some(joined) = join_set.join_next().await {
                let outcome = match joined {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(err)) => {
                        join_set.abort_all();
                        return Err(err);
                    }
                    Err(e) => {
                        join_set.abort_all();
                        return Err(EngineError::Validation(format!(
                            "sub-problem pipeline panicked: {e}"
                        )));
                    }
                };
                debug!(
                    session_id = %session.id,
                    sub_problem = outcome.index,
                    decision = %outcome.summary.decision,
                    rounds = outcome.rounds_used,
                    "sub-problem pipeline finished"
                );
                session.usage.add(&outcome.usage);
                rounds_used_max = rounds_used_max.max(outcome.rounds_used);
                session.sub_problems[outcome.index].result = Some(outcome.result.clone());
                results[outcome.index] = Some(outcome.result);
            }

            pending.retain(|i| results[*i].is_none());
            self.store.update(session).await?;
        }
        // A kill arriving during the final wave's synthesis resolves after
        // the pipelines return.
        self.check_kill()?;

        // Mirror the pipelines' progression onto the session record.
        self.transition(session, SessionPhase::Deliberation, "all sub-problem rounds complete")?;
        session.round_number = rounds_used_max.min(session.max_rounds);
        self.transition(session, SessionPhase::Voting, "votes collected")?;
        self.transition(session, SessionPhase::Synthesis, "sub-problem results synthesized")?;
        self.store.update(session).await?;

        let sub_results: Vec<String> = results.into_iter().flatten().collect();
        let final_answer = if sub_results.len() > 1 {
            self.transition(session, SessionPhase::MetaSynthesis, "combining sub-problem results")?;
            let answer = self.meta_synthesize(session, &sub_results).await;
            self.bus.publish(DeliberationEvent::MetaSynthesisComplete {
                session_id: session.id.clone(),
                result_preview: preview(&answer, PREVIEW_CHARS),
                timestamp: Utc::now(),
            });
            answer
        } else {
            sub_results.first().cloned().unwrap_or_default()
        };

        self.transition(session, SessionPhase::Completed, "session complete")?;
        info!(session_id = %session.id, cost = session.usage.cost, "session completed");

        Ok(SessionReport {
            session_id: session.id.clone(),
            final_answer,
            sub_problem_results: sub_results,
            usage: session.usage,
        })
    }

    /// Break the problem into sub-problems. Model-driven; degrades to a
    /// single sub-problem covering the whole statement when the model output
    /// is unusable.
    async fn decompose(&self, session: &Session) -> EngineResult<(Vec<SubProblem>, ModelUsage)> {
        let context_str = match &session.context {
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        };
        let mut user = format!(
            "Break this business problem into 1-4 sub-problems. Respond with JSON: \
            {{\"sub_problems\": [{{\"goal\": \"...\", \"context\": \"...\", \
            \"complexity\": 0, \"depends_on\": [], \"constraints\": []}}]}}. \
            `depends_on` holds indices of sub-problems that must be resolved first.\n\n\
            Problem:\n{}",
            session.problem
        );
        if let Some(ctx) = &context_str {
            user.push_str(&format!("\n\nContext:\n{ctx}"));
        }
        if let Some(comparison) = detect_comparison(&session.problem, context_str.as_deref()) {
            let questions: Vec<String> = comparison
                .research_questions()
                .into_iter()
                .map(|q| format!("[{}] {}", q.priority, q.question))
                .collect();
            debug!(
                comparison = %comparison.comparison_type,
                "comparison detected, steering decomposition"
            );
            user.push_str(&format!(
                "\n\nThis is a comparison between \"{}\" and \"{}\". \
                Make sure the sub-problems answer:\n{}",
                comparison.option_a,
                comparison.option_b,
                questions.join("\n")
            ));
        }

        let request = ModelRequest::new(
            "You are a strategy analyst decomposing a problem for a board deliberation.",
            &user,
            &self.model,
        )
        .max_tokens(self.config.max_tokens)
        .temperature(0.2)
        .prefill("{\"sub_problems\":");

        let limiter = self.registry.limiter(self.client.provider_name()).await?;
        limiter.acquire(1).await?;
        let response = timed_call(&self.client, &request, self.config.call_timeout_ms).await?;
        let usage = response.usage;

        let sub_problems = match response
            .text()
            .ok()
            .and_then(|t| extract_structured::<DecompositionPayload>(t).ok())
        {
            Some((payload, _)) if !payload.sub_problems.is_empty() => {
                let count = payload.sub_problems.len();
                let subs: Vec<SubProblem> = payload
                    .sub_problems
                    .into_iter()
                    .map(|p| {
                        let mut sub = SubProblem::new(&p.goal, &p.context, p.complexity);
                        sub.depends_on = p
                            .depends_on
                            .into_iter()
                            .filter(|&d| d < count)
                            .collect();
                        sub.constraints = p.constraints;
                        sub
                    })
                    .collect();
                subs
            }
            _ => {
                warn!(
                    operation = "decompose",
                    cause = "unusable model output",
                    fallback = "single sub-problem",
                    session_id = %session.id,
                    "decomposition degraded to the whole problem"
                );
                vec![SubProblem::new(&session.problem, "", 5)]
            }
        };

        Ok((sub_problems, usage))
    }

    /// Combine sub-problem results into one answer. Degrades to a
    /// deterministic concatenation when the model is unavailable, since all
    /// sub-problem results already exist.
    async fn meta_synthesize(&self, session: &Session, sub_results: &[String]) -> String {
        let numbered: String = sub_results
            .iter()
            .enumerate()
            .map(|(i, r)| format!("Sub-problem {}:\n{r}", i + 1))
            .collect::<Vec<_>>()
            .join("\n\n");
        let request = ModelRequest::new(
            "You are the board secretary. Combine the sub-problem conclusions into \
            one coherent final recommendation.",
            &format!("Problem:\n{}\n\n{numbered}", session.problem),
            &self.model,
        )
        .max_tokens(self.config.max_tokens)
        .temperature(0.3);

        match timed_call(&self.client, &request, self.config.call_timeout_ms).await {
            Ok(response) => match response.text() {
                Ok(text) => return text.to_string(),
                Err(e) => warn!(
                    operation = "meta_synthesize",
                    cause = %e,
                    fallback = "concatenated sub-results",
                    "meta-synthesis returned no content"
                ),
            },
            Err(e) => warn!(
                operation = "meta_synthesize",
                cause = %e,
                fallback = "concatenated sub-results",
                "meta-synthesis call failed"
            ),
        }
        numbered
    }

    fn transition(
        &self,
        session: &mut Session,
        to: SessionPhase,
        reason: &str,
    ) -> EngineResult<()> {
        let from = session.phase;
        session
            .transition(to, reason)
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        self.bus.publish(DeliberationEvent::PhaseChanged {
            session_id: session.id.clone(),
            sub_problem_index: None,
            from,
            to,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn check_kill(&self) -> EngineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Deliberation(DeliberationFault::Killed {
                reason: "kill signal received".to_string(),
            }));
        }
        Ok(())
    }

    /// Terminal bookkeeping for a failed or killed session: phase, reason,
    /// error event, persistence. Never leaves the session mid-phase.
    async fn end_with_error(&self, session: &mut Session, err: &EngineError) {
        let terminal = match err {
            EngineError::Deliberation(DeliberationFault::Killed { .. }) => SessionPhase::Killed,
            _ => SessionPhase::Failed,
        };
        let reason = err.to_string();
        if !session.phase.is_terminal() {
            if let Err(e) = session.transition(terminal, &reason) {
                warn!(session_id = %session.id, error = %e, "terminal transition rejected");
                session.failure_reason = Some(reason.clone());
            }
        }
        self.bus.publish(DeliberationEvent::Error {
            session_id: session.id.clone(),
            sub_problem_index: None,
            kind: err.kind().to_string(),
            message: reason,
            timestamp: Utc::now(),
        });
        self.bus.publish(DeliberationEvent::SessionEnded {
            session_id: session.id.clone(),
            status: session.status,
            total_cost: session.usage.cost,
            timestamp: Utc::now(),
        });
        if let Err(e) = self.store.update(session).await {
            warn!(session_id = %session.id, error = %e, "failed to persist terminal session");
        }
        info!(session_id = %session.id, status = %session.status, "session ended");
    }
}

async fn timed_call(
    client: &SharedModelClient,
    request: &ModelRequest,
    budget_ms: u64,
) -> EngineResult<crate::model::ModelResponse> {
    match tokio::time::timeout(
        std::time::Duration::from_millis(budget_ms),
        client.complete(request),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(EngineError::Deliberation(DeliberationFault::Timeout {
            elapsed_ms: budget_ms,
            budget_ms,
        })),
    }
}

/// One sub-problem's full pipeline: panel events, rounds with dedup,
/// voting, synthesis. Operates on its own [`DeliberationState`]; the
/// caller applies the outcome to the session record.
async fn run_pipeline(
    ctx: Arc<PipelineCtx>,
    index: usize,
    sub: SubProblem,
    panel: Vec<PersonaProfile>,
) -> EngineResult<PipelineOutcome> {
    let mut problem = sub.goal.clone();
    if !sub.context.is_empty() {
        problem.push_str(&format!("\n\nContext: {}", sub.context));
    }
    if !sub.constraints.is_empty() {
        problem.push_str(&format!("\n\nConstraints:\n- {}", sub.constraints.join("\n- ")));
    }
    let mut state = DeliberationState::new(&ctx.session_id, &problem);
    state.sub_problem_index = Some(index);
    state.personas = panel;
    state.phase = SessionPhase::PersonaSelection;
    let mut usage = ModelUsage::default();

    ctx.bus.publish(DeliberationEvent::PanelSelected {
        session_id: ctx.session_id.clone(),
        sub_problem_index: index,
        persona_codes: state.personas.iter().map(|p| p.code.clone()).collect(),
        timestamp: Utc::now(),
    });

    advance(&ctx, &mut state, SessionPhase::InitialRound, "panel selected")?;

    let executor = TurnExecutor::new(
        Arc::clone(&ctx.client),
        Arc::clone(&ctx.limiter),
        ctx.config.clone(),
        &ctx.model,
    );
    let mut facilitator = Facilitator::new(ctx.config.clone());
    // Stable persona order for dedup's first-wins resolution.
    let persona_order: HashMap<String, usize> = state
        .personas
        .iter()
        .enumerate()
        .map(|(i, p)| (p.code.clone(), i))
        .collect();

    loop {
        let round = state.round_number;
        let stage = RoundStage::classify(round, ctx.config.max_rounds);
        ctx.bus.publish(DeliberationEvent::RoundStarted {
            session_id: ctx.session_id.clone(),
            sub_problem_index: index,
            round,
            phase: state.phase,
            timestamp: Utc::now(),
        });

        let plan = RoundPlan {
            round,
            phase: state.phase,
            temperature_adjustment: stage.temperature_adjustment(),
        };
        let result = executor.run_round(&state, plan, &ctx.cancel).await?;

        let mut round_usage = ModelUsage::default();
        for c in &result.contributions {
            round_usage.add(&c.usage);
        }
        usage.add(&round_usage);
        ctx.cost.add(round_usage.cost)?;

        // Dedup runs in persona order regardless of completion order.
        let mut ordered = result.contributions;
        ordered.sort_by_key(|c| persona_order.get(&c.persona_code).copied().unwrap_or(usize::MAX));
        let completion_order: Vec<String> =
            ordered.iter().map(|c| c.persona_code.clone()).collect();
        let outcome = ctx
            .dedup
            .filter_duplicates(ordered, |c: &ContributionMessage| c.content.as_str())
            .await;
        let novelty_rate = outcome.novelty_rate();

        for dropped in &outcome.dropped {
            ctx.bus.publish(DeliberationEvent::DuplicateFiltered {
                session_id: ctx.session_id.clone(),
                sub_problem_index: index,
                persona_code: dropped.item.persona_code.clone(),
                round,
                similarity: dropped.similarity,
                timestamp: Utc::now(),
            });
        }

        // History keeps completion order; only the filtering pass is pinned
        // to persona order.
        let mut kept = outcome.kept;
        kept.sort_by_key(|c| {
            completion_order
                .iter()
                .position(|code| code == &c.persona_code)
                .unwrap_or(usize::MAX)
        });
        for contribution in kept {
            let persona_name = state
                .personas
                .iter()
                .find(|p| p.code == contribution.persona_code)
                .map(|p| p.display_name.clone())
                .unwrap_or_else(|| contribution.persona_code.clone());
            ctx.bus.publish(DeliberationEvent::Contribution {
                session_id: ctx.session_id.clone(),
                sub_problem_index: index,
                persona_code: contribution.persona_code.clone(),
                persona_name,
                content: contribution.content.clone(),
                round: contribution.round,
                summary: contribution.summary.clone(),
                timestamp: Utc::now(),
            });
            state.history.push(contribution);
        }

        let verdict = facilitator.evaluate_round(round, novelty_rate);
        debug!(
            session_id = %ctx.session_id,
            sub_problem = index,
            round,
            novelty_rate,
            verdict = ?verdict,
            "round evaluated"
        );
        if verdict.should_vote() {
            advance(&ctx, &mut state, SessionPhase::Voting, &verdict.reason())?;
            break;
        }
        advance(&ctx, &mut state, SessionPhase::Deliberation, "deliberation continues")?;
    }

    // Voting.
    ctx.check_kill()?;
    let collector = VoteCollector::new(
        Arc::clone(&ctx.client),
        Arc::clone(&ctx.limiter),
        ctx.config.clone(),
        &ctx.model,
    );
    let summary = collector.collect(&state).await?;
    usage.add(&summary.usage);
    ctx.cost.add(summary.usage.cost)?;
    for rec in &summary.recommendations {
        ctx.bus.publish(DeliberationEvent::VoteRecorded {
            session_id: ctx.session_id.clone(),
            sub_problem_index: index,
            persona_code: rec.persona_code.clone(),
            decision: rec.decision.to_string(),
            confidence: rec.confidence,
            timestamp: Utc::now(),
        });
    }
    advance(&ctx, &mut state, SessionPhase::Synthesis, "votes aggregated")?;

    // Synthesis.
    ctx.check_kill()?;
    let (result, synthesis_usage) = synthesize(&ctx, &state, &summary).await?;
    usage.add(&synthesis_usage);
    ctx.cost.add(synthesis_usage.cost)?;

    ctx.bus.publish(DeliberationEvent::SubproblemComplete {
        session_id: ctx.session_id.clone(),
        sub_problem_index: index,
        result_preview: preview(&result, PREVIEW_CHARS),
        timestamp: Utc::now(),
    });
    info!(
        session_id = %ctx.session_id,
        sub_problem = index,
        rounds = state.round_number,
        "sub-problem complete"
    );

    Ok(PipelineOutcome {
        index,
        result,
        summary,
        rounds_used: state.round_number,
        usage,
    })
}

/// Phase transition for one pipeline's working state, with the same
/// validity rules as the session record.
fn advance(
    ctx: &PipelineCtx,
    state: &mut DeliberationState,
    to: SessionPhase,
    reason: &str,
) -> EngineResult<()> {
    if !state.phase.valid_transitions().contains(&to) {
        return Err(EngineError::Deliberation(DeliberationFault::InvalidPhase {
            operation: format!("transition to {to}"),
            phase: state.phase.to_string(),
        }));
    }
    let from = state.phase;
    state.phase = to;
    if to.is_round_phase() {
        state.round_number += 1;
    }
    ctx.bus.publish(DeliberationEvent::PhaseChanged {
        session_id: ctx.session_id.clone(),
        sub_problem_index: state.sub_problem_index,
        from,
        to,
        reason: reason.to_string(),
        timestamp: Utc::now(),
    });
    Ok(())
}

/// Produce the sub-problem's final answer from the deliberation and votes.
async fn synthesize(
    ctx: &PipelineCtx,
    state: &DeliberationState,
    summary: &VotingSummary,
) -> EngineResult<(String, ModelUsage)> {
    let votes: String = summary
        .recommendations
        .iter()
        .map(|r| {
            format!(
                "{} voted {} (confidence {:.2}): {}",
                r.persona_code, r.decision, r.confidence, r.recommendation
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let conditions = if summary.conditions.is_empty() {
        String::new()
    } else {
        format!("\nConditions raised:\n{}", summary.conditions.join("\n"))
    };
    let request = ModelRequest::new(
        "You are the board facilitator writing the final synthesis of a deliberation. \
        State the decision, the key arguments for and against, and any conditions.",
        &format!(
            "Problem:\n{}\n\nPanel decision: {} (weighted confidence {:.2})\n\nVotes:\n{}{}",
            state.problem, summary.decision, summary.weighted_confidence, votes, conditions
        ),
        &ctx.model,
    )
    .max_tokens(ctx.config.max_tokens)
    .temperature(0.3);

    ctx.limiter.acquire(1).await?;
    let response = timed_call(&ctx.client, &request, ctx.config.call_timeout_ms).await?;
    let text = response.text()?.to_string();
    Ok((text, response.usage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use crate::config::{CacheConfig, RateLimitConfig};
    use crate::dedup::DedupConfig;
    use crate::state::SessionStore;
    use crate::error::EngineResult;
    use crate::events::EventBus;
    use crate::model::{ModelClient, ModelResponse};
    use crate::state::{MemorySessionStore, SessionStatus};

    /// Scripted client: routes on prompt markers, unique content per call.
    struct ScriptedClient {
        calls: AtomicU32,
        decomposition: String,
        cost_per_call: f64,
    }

    impl ScriptedClient {
        fn single_sub() -> Self {
            Self {
                calls: AtomicU32::new(0),
                decomposition: r#"{"sub_problems": [{"goal": "Evaluate the expansion", "context": "", "complexity": 5, "depends_on": [], "constraints": []}]}"#.to_string(),
                cost_per_call: 0.01,
            }
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn complete(&self, request: &ModelRequest) -> EngineResult<ModelResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let system = &request.system_prompt;
            let content = if system.contains("decomposing a problem") {
                self.decomposition.clone()
            } else if system.contains("cast your final vote") {
                format!(
                    r#"{{"recommendation": "Proceed with option {call}", "reasoning": "r", "decision": "yes", "confidence": 0.8, "conditions": []}}"#
                )
            } else if system.contains("final synthesis") {
                format!("Synthesis: proceed. (call {call})")
            } else if system.contains("board secretary") {
                format!("Combined answer. (call {call})")
            } else {
                // Persona turn: pairwise-distinct topics so novelty stays high.
                let topics = [
                    "hiring senior engineers first",
                    "cash runway versus margin impact",
                    "customer churn under price changes",
                    "infrastructure scaling limits",
                    "regulatory exposure in new regions",
                    "brand positioning against incumbents",
                ];
                format!(
                    "Point {call}: weigh {}.",
                    topics[call as usize % topics.len()]
                )
            };
            Ok(ModelResponse {
                success: true,
                content: Some(content),
                usage: ModelUsage {
                    input_tokens: 100,
                    output_tokens: 50,
                    cost: self.cost_per_call,
                },
            })
        }

        fn provider_name(&self) -> &str {
            "scripted"
        }
    }

    /// Cancels the held token the first time a call's system prompt matches
    /// the marker, then answers from the script as usual.
    struct KillOnMarkerClient {
        script: ScriptedClient,
        marker: &'static str,
        kill: Arc<std::sync::Mutex<Option<CancellationToken>>>,
    }

    #[async_trait]
    impl ModelClient for KillOnMarkerClient {
        async fn complete(&self, request: &ModelRequest) -> EngineResult<ModelResponse> {
            if request.system_prompt.contains(self.marker) {
                if let Some(token) = self.kill.lock().unwrap().take() {
                    token.cancel();
                }
            }
            self.script.complete(request).await
        }

        fn provider_name(&self) -> &str {
            "scripted"
        }
    }

    /// Flags whether any request's user content carried the needle.
    struct PromptWatchClient {
        script: ScriptedClient,
        needle: &'static str,
        seen: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ModelClient for PromptWatchClient {
        async fn complete(&self, request: &ModelRequest) -> EngineResult<ModelResponse> {
            if request.messages.iter().any(|m| m.content.contains(self.needle)) {
                self.seen.store(true, Ordering::SeqCst);
            }
            self.script.complete(request).await
        }

        fn provider_name(&self) -> &str {
            "scripted"
        }
    }

    fn orchestrator(client: impl ModelClient + 'static, config: SessionConfig) -> SessionOrchestrator {
        let registry = Arc::new(
            ResourceRegistry::new(RateLimitConfig::new(10_000, 1.0), CacheConfig::default()),
        );
        SessionOrchestrator::new(
            Arc::new(client),
            PersonaCatalog::builtin(),
            registry,
            Arc::new(SemanticDedup::keyword_only(DedupConfig::default())),
            EventBus::new().shared(),
            Arc::new(MemorySessionStore::new()),
            config,
            "test-model",
        )
        .unwrap()
    }

    fn small_config() -> SessionConfig {
        SessionConfig {
            max_rounds: 2,
            panel_size: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_single_sub_problem_happy_path() {
        let orch = orchestrator(ScriptedClient::single_sub(), small_config());
        let report = orch
            .run("user-1", "Should we expand into Europe?", serde_json::Value::Null)
            .await
            .unwrap();
        assert!(report.final_answer.starts_with("Synthesis"));
        assert_eq!(report.sub_problem_results.len(), 1);
        assert!(report.usage.cost > 0.0);
    }

    #[tokio::test]
    async fn test_session_record_reaches_completed() {
        let store = Arc::new(MemorySessionStore::new());
        let registry = Arc::new(
            ResourceRegistry::new(RateLimitConfig::new(10_000, 1.0), CacheConfig::default()),
        );
        let orch = SessionOrchestrator::new(
            Arc::new(ScriptedClient::single_sub()),
            PersonaCatalog::builtin(),
            registry,
            Arc::new(SemanticDedup::keyword_only(DedupConfig::default())),
            EventBus::new().shared(),
            Arc::clone(&store) as SharedSessionStore,
            small_config(),
            "test-model",
        )
        .unwrap();

        let report = orch
            .run("user-1", "Should we expand?", serde_json::Value::Null)
            .await
            .unwrap();
        let session = store.get(&report.session_id).await.unwrap();
        assert_eq!(session.phase, SessionPhase::Completed);
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.round_number <= session.max_rounds);
        assert!(!session.transitions.is_empty());
    }

    #[tokio::test]
    async fn test_cost_limit_fails_session() {
        let config = SessionConfig {
            cost_limit: 0.05, // a handful of calls at 0.01 each
            ..small_config()
        };
        let orch = orchestrator(ScriptedClient::single_sub(), config);
        let err = orch
            .run("user-1", "Should we expand?", serde_json::Value::Null)
            .await
            .unwrap_err();
        match err {
            EngineError::Deliberation(DeliberationFault::CostLimitExceeded { .. }) => {}
            other => panic!("expected cost limit, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_killed_session_has_killed_status() {
        let store = Arc::new(MemorySessionStore::new());
        let registry = Arc::new(
            ResourceRegistry::new(RateLimitConfig::new(10_000, 1.0), CacheConfig::default()),
        );
        let bus = EventBus::new().shared();
        let orch = SessionOrchestrator::new(
            Arc::new(ScriptedClient::single_sub()),
            PersonaCatalog::builtin(),
            registry,
            Arc::new(SemanticDedup::keyword_only(DedupConfig::default())),
            Arc::clone(&bus),
            Arc::clone(&store) as SharedSessionStore,
            small_config(),
            "test-model",
        )
        .unwrap();

        // Kill before the run starts; the first checkpoint catches it.
        orch.kill_handle().cancel();
        let err = orch
            .run("user-1", "Should we expand?", serde_json::Value::Null)
            .await
            .unwrap_err();
        match err {
            EngineError::Deliberation(DeliberationFault::Killed { .. }) => {}
            other => panic!("expected killed, got {other}"),
        }
        let history = bus.history();
        let ended = history
            .iter()
            .find(|e| e.event_type() == "session_ended")
            .unwrap();
        match ended {
            DeliberationEvent::SessionEnded { status, .. } => {
                assert_eq!(*status, SessionStatus::Killed)
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_kill_during_voting_ends_session_killed() {
        let registry = Arc::new(
            ResourceRegistry::new(RateLimitConfig::new(10_000, 1.0), CacheConfig::default()),
        );
        let bus = EventBus::new().shared();
        let kill: Arc<std::sync::Mutex<Option<CancellationToken>>> =
            Arc::new(std::sync::Mutex::new(None));
        let orch = SessionOrchestrator::new(
            Arc::new(KillOnMarkerClient {
                script: ScriptedClient::single_sub(),
                marker: "cast your final vote",
                kill: Arc::clone(&kill),
            }),
            PersonaCatalog::builtin(),
            registry,
            Arc::new(SemanticDedup::keyword_only(DedupConfig::default())),
            Arc::clone(&bus),
            Arc::new(MemorySessionStore::new()),
            small_config(),
            "test-model",
        )
        .unwrap();
        *kill.lock().unwrap() = Some(orch.kill_handle());

        let err = orch
            .run("user-1", "Should we expand?", serde_json::Value::Null)
            .await
            .unwrap_err();
        match err {
            EngineError::Deliberation(DeliberationFault::Killed { .. }) => {}
            other => panic!("expected killed, got {other}"),
        }
        let ended = bus
            .history()
            .into_iter()
            .find(|e| e.event_type() == "session_ended")
            .unwrap();
        match ended {
            DeliberationEvent::SessionEnded { status, .. } => {
                assert_eq!(status, SessionStatus::Killed)
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_kill_during_synthesis_ends_session_killed() {
        let registry = Arc::new(
            ResourceRegistry::new(RateLimitConfig::new(10_000, 1.0), CacheConfig::default()),
        );
        let kill: Arc<std::sync::Mutex<Option<CancellationToken>>> =
            Arc::new(std::sync::Mutex::new(None));
        let orch = SessionOrchestrator::new(
            Arc::new(KillOnMarkerClient {
                script: ScriptedClient::single_sub(),
                marker: "final synthesis",
                kill: Arc::clone(&kill),
            }),
            PersonaCatalog::builtin(),
            registry,
            Arc::new(SemanticDedup::keyword_only(DedupConfig::default())),
            EventBus::new().shared(),
            Arc::new(MemorySessionStore::new()),
            small_config(),
            "test-model",
        )
        .unwrap();
        *kill.lock().unwrap() = Some(orch.kill_handle());

        let err = orch
            .run("user-1", "Should we expand?", serde_json::Value::Null)
            .await
            .unwrap_err();
        match err {
            EngineError::Deliberation(DeliberationFault::Killed { .. }) => {}
            other => panic!("expected killed, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_session_dedup_threshold_overrides_filter_config() {
        let registry = Arc::new(
            ResourceRegistry::new(RateLimitConfig::new(10_000, 1.0), CacheConfig::default()),
        );
        let bus = EventBus::new().shared();
        // A filter built with a drop-everything threshold; the session
        // config's 0.80 must win.
        let strict = SemanticDedup::keyword_only(DedupConfig {
            threshold: 0.0,
            ..Default::default()
        });
        let orch = SessionOrchestrator::new(
            Arc::new(ScriptedClient::single_sub()),
            PersonaCatalog::builtin(),
            registry,
            Arc::new(strict),
            Arc::clone(&bus),
            Arc::new(MemorySessionStore::new()),
            small_config(),
            "test-model",
        )
        .unwrap();
        assert!((orch.dedup.config().threshold - 0.80).abs() < 1e-9);

        orch.run("user-1", "Should we expand?", serde_json::Value::Null)
            .await
            .unwrap();
        assert!(bus
            .history()
            .iter()
            .all(|e| e.event_type() != "duplicate_filtered"));
    }

    #[tokio::test]
    async fn test_sub_problem_constraints_reach_prompts() {
        let seen = Arc::new(AtomicBool::new(false));
        let client = PromptWatchClient {
            script: ScriptedClient {
                calls: AtomicU32::new(0),
                decomposition: r#"{"sub_problems": [{"goal": "Plan the hiring ramp",
                    "context": "Q3 planning", "complexity": 4, "depends_on": [],
                    "constraints": ["existing headcount only", "no external recruiters"]}]}"#
                    .to_string(),
                cost_per_call: 0.0,
            },
            needle: "existing headcount only",
            seen: Arc::clone(&seen),
        };
        let orch = orchestrator(client, small_config());
        orch.run("user-1", "How should we staff the expansion?", serde_json::Value::Null)
            .await
            .unwrap();
        assert!(seen.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_garbage_decomposition_degrades_to_single_sub() {
        let client = ScriptedClient {
            calls: AtomicU32::new(0),
            decomposition: "not json at all".to_string(),
            cost_per_call: 0.0,
        };
        let orch = orchestrator(client, small_config());
        let report = orch
            .run("user-1", "Should we expand?", serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(report.sub_problem_results.len(), 1);
    }

    #[tokio::test]
    async fn test_dependency_cycle_rejected() {
        let client = ScriptedClient {
            calls: AtomicU32::new(0),
            decomposition: r#"{"sub_problems": [
                {"goal": "A", "depends_on": [1]},
                {"goal": "B", "depends_on": [0]}
            ]}"#
            .to_string(),
            cost_per_call: 0.0,
        };
        let orch = orchestrator(client, small_config());
        let err = orch
            .run("user-1", "Should we expand?", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_cost_meter_unlimited_when_zero() {
        let meter = CostMeter::new(0.0);
        assert!(meter.add(1_000.0).is_ok());
    }

    #[test]
    fn test_cost_meter_trips_over_limit() {
        let meter = CostMeter::new(1.0);
        assert!(meter.add(0.6).is_ok());
        let err = meter.add(0.6).unwrap_err();
        match err {
            EngineError::Deliberation(DeliberationFault::CostLimitExceeded { spent, limit }) => {
                assert!(spent > limit);
            }
            other => panic!("unexpected: {other}"),
        }
    }
}
