//! Cognitive loop
//!
//! Drives one user request to a final answer:
//!
//! 1. Perceive the query (retried with backoff)
//! 2. Retrieve related tool outputs from memory
//! 3. Decide the next step (retried with backoff)
//! 4. Check the proposed calls for repeats, then dispatch them
//! 5. Repeat until a final answer, a repeat, the step budget or the failure
//!    limit ends the session
//!
//! # Limits
//!
//! - At most `max_steps` successful tool calls per session
//! - `max_consecutive_failures` failed calls in a row end the session
//! - Each collaborator attempt is bounded by `llm_timeout`
//! - An empty batch is a decision failure
//!
//! Every exit path, cancellation included, produces exactly one answer and
//! one `final_answer` memory record.

use sdk::errors::{EngineError, ErrorExt};
use sdk::types::ToolCall;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::decision::{Decider, Decision, DecisionContext};
use crate::memory::{MemoryQuery, MemoryRecord, MemoryStore, NewRecord, RecordKind};
use crate::perception::{Perceiver, Perception, PerceptionRequest};
use crate::tools::ToolRegistry;

use super::retry::RetryPolicy;
use super::session::{LoopPhase, SessionOutcome, SessionState, SessionStatus, Step};

/// Longest tool output stored in a single memory record
const MAX_RECORD_CHARS: usize = 8_000;

/// Loop limits, taken from `[session]`, `[memory]` and `[retry]`
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_steps: usize,
    pub loop_window: usize,
    pub max_consecutive_failures: usize,
    pub top_k: usize,
    pub llm_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_steps: config.session.max_steps.max(1),
            loop_window: config.session.loop_window.max(1),
            max_consecutive_failures: config.session.max_consecutive_failures.max(1),
            top_k: config.memory.top_k,
            llm_timeout: Duration::from_secs(config.session.llm_timeout_secs),
            retry: RetryPolicy::from_config(&config.retry),
        }
    }
}

/// How an iteration ended when it did not simply continue
enum Exit {
    Answer(String),
    Stuck(ToolCall),
    Failed(EngineError),
    TooManyFailures,
    Cancelled,
}

pub struct CognitiveLoop {
    registry: Arc<ToolRegistry>,
    memory: Arc<MemoryStore>,
    perceiver: Arc<dyn Perceiver>,
    decider: Arc<dyn Decider>,
    settings: LoopSettings,
}

impl CognitiveLoop {
    pub fn new(
        registry: Arc<ToolRegistry>,
        memory: Arc<MemoryStore>,
        perceiver: Arc<dyn Perceiver>,
        decider: Arc<dyn Decider>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            registry,
            memory,
            perceiver,
            decider,
            settings,
        }
    }

    /// Run one session to completion
    ///
    /// Never returns an error: failures end the session with a diagnostic
    /// answer and a non-`Completed` status.
    pub async fn run(&self, query: &str, cancel: CancellationToken) -> SessionOutcome {
        let start = Instant::now();
        let mut state = SessionState::new(query);
        info!(session_id = %state.session_id, query = %query, "Session started");

        let exit = self.drive(&mut state, &cancel).await;
        let outcome = self.finish(&mut state, exit).await;

        info!(
            session_id = %outcome.session_id,
            status = %outcome.status,
            steps = outcome.steps,
            calls = outcome.history.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Session finished"
        );
        outcome
    }

    async fn drive(&self, state: &mut SessionState, cancel: &CancellationToken) -> Option<Exit> {
        let tools = self.registry.describe_tools();
        let ceiling = self.iteration_ceiling();
        let mut iterations = 0;

        loop {
            if state.step_count >= self.settings.max_steps {
                return None;
            }
            if iterations >= ceiling {
                warn!(
                    session_id = %state.session_id,
                    iterations,
                    "Iteration ceiling reached without using the step budget"
                );
                return None;
            }
            iterations += 1;

            state.advance(LoopPhase::Perceiving);
            let perception = match guarded(cancel, self.perceive(state)).await {
                Ok(Ok(p)) => p,
                Ok(Err(e)) => return Some(Exit::Failed(e)),
                Err(_) => return Some(Exit::Cancelled),
            };
            self.remember(
                NewRecord::new(
                    &state.session_id,
                    RecordKind::Perception,
                    format!("Perception of \"{}\": {}", state.original_query, perception.summary()),
                ),
                cancel,
            )
            .await;
            state.perception = Some(perception.clone());

            state.advance(LoopPhase::Retrieving);
            let retrieved = match guarded(cancel, self.retrieve(state, &perception)).await {
                Ok(records) => records,
                Err(_) => return Some(Exit::Cancelled),
            };

            state.advance(LoopPhase::Deciding);
            let decision = {
                let context = DecisionContext {
                    query: &state.original_query,
                    step: state.step_count + 1,
                    max_steps: self.settings.max_steps,
                    perception: &perception,
                    retrieved: &retrieved,
                    history: &state.history,
                    last_failure: state.last_failure.as_deref(),
                    tools: &tools,
                };
                match guarded(cancel, self.decide(&context)).await {
                    Ok(Ok(d)) => d,
                    Ok(Err(e)) => return Some(Exit::Failed(e)),
                    Err(_) => return Some(Exit::Cancelled),
                }
            };

            let calls = match decision {
                Decision::FinalAnswer(answer) => return Some(Exit::Answer(answer)),
                Decision::ToolCall(call) => vec![call],
                Decision::Batch(calls) if calls.is_empty() => {
                    return Some(Exit::Failed(EngineError::DecisionFailure(
                        "decision proposed an empty batch".to_string(),
                    )))
                }
                Decision::Batch(calls) => calls,
            };

            let calls = match self.admit(state, calls) {
                Ok(calls) => calls,
                Err(repeated) => return Some(Exit::Stuck(repeated)),
            };

            state.advance(LoopPhase::Executing);
            let dispatched = match guarded(cancel, self.execute(&calls)).await {
                Ok(d) => d,
                Err(_) => return Some(Exit::Cancelled),
            };

            for item in dispatched {
                let text = truncate(&format!("{} -> {}", item.call, item.result.text()), MAX_RECORD_CHARS);
                self.remember(
                    NewRecord::new(&state.session_id, RecordKind::ToolOutput, text)
                        .with_tool(&item.call.name),
                    cancel,
                )
                .await;

                let mut step = Step::new(0, item.call, item.result);
                step.elapsed_ms = item.elapsed.as_millis() as u64;
                step.endpoint = item.endpoint;
                state.record(step);
            }

            if state.consecutive_failures >= self.settings.max_consecutive_failures {
                return Some(Exit::TooManyFailures);
            }
        }
    }

    /// Upper bound on iterations; each one dispatches at least one call
    fn iteration_ceiling(&self) -> usize {
        (self.settings.max_steps + 1) * self.settings.max_consecutive_failures
    }

    /// Loop-check proposed calls in order and fit them to the step budget
    fn admit(&self, state: &SessionState, calls: Vec<ToolCall>) -> Result<Vec<ToolCall>, ToolCall> {
        let remaining = self.settings.max_steps.saturating_sub(state.step_count);
        let mut admitted: Vec<ToolCall> = Vec::with_capacity(calls.len());

        for call in calls {
            let signature = call.signature();
            if state.is_repeat(&call, self.settings.loop_window)
                || admitted.iter().any(|c| c.signature() == signature)
            {
                warn!(
                    session_id = %state.session_id,
                    call = %signature,
                    "Repeated tool call detected"
                );
                return Err(call);
            }
            admitted.push(call);
        }

        if admitted.len() > remaining {
            debug!(
                proposed = admitted.len(),
                remaining, "Truncating batch to the remaining step budget"
            );
            admitted.truncate(remaining);
        }
        Ok(admitted)
    }

    async fn perceive(&self, state: &SessionState) -> Result<Perception, EngineError> {
        let request = PerceptionRequest {
            query: state.original_query.clone(),
            prior_steps: state.prior_step_summaries(),
        };
        let deadline = self.settings.llm_timeout;

        self.settings
            .retry
            .run("perception", |_| {
                let request = &request;
                async move {
                    match timeout(deadline, self.perceiver.perceive(request)).await {
                        Ok(result) => result,
                        Err(_) => Err(EngineError::Timeout(deadline.as_millis() as u64)),
                    }
                }
            })
            .await
            .map_err(|e| match e {
                EngineError::PerceptionFailure(_) | EngineError::Cancelled => e,
                other => EngineError::PerceptionFailure(other.to_string()),
            })
    }

    async fn decide(&self, context: &DecisionContext<'_>) -> Result<Decision, EngineError> {
        let deadline = self.settings.llm_timeout;

        self.settings
            .retry
            .run("decision", |_| async move {
                match timeout(deadline, self.decider.decide(context)).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::Timeout(deadline.as_millis() as u64)),
                }
            })
            .await
            .map_err(|e| match e {
                EngineError::DecisionFailure(_) | EngineError::Cancelled => e,
                other => EngineError::DecisionFailure(other.to_string()),
            })
    }

    /// Tool outputs related to the query; memory trouble yields no context
    async fn retrieve(&self, state: &SessionState, perception: &Perception) -> Vec<MemoryRecord> {
        let text = match &perception.intent {
            Some(intent) => format!("{} {}", state.original_query, intent),
            None => state.original_query.clone(),
        };
        let query = MemoryQuery::new(text, self.settings.top_k).kind(RecordKind::ToolOutput);

        match self.memory.query_with(&query).await {
            Ok(hits) => hits.into_iter().map(|h| h.record).collect(),
            Err(e) => {
                warn!(session_id = %state.session_id, error = %e, "Memory retrieval failed");
                Vec::new()
            }
        }
    }

    async fn execute(&self, calls: &[ToolCall]) -> Vec<crate::tools::Dispatched> {
        match calls {
            [single] => vec![self.registry.dispatch(single).await],
            many => self.registry.dispatch_batch(many).await,
        }
    }

    /// Append a record; a failed write is logged, never fatal
    async fn remember(&self, record: NewRecord, cancel: &CancellationToken) {
        let kind = record.kind;
        match guarded(cancel, self.memory.add(record)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(kind = %kind, error = %e, "Failed to store memory record"),
            Err(_) => debug!(kind = %kind, "Memory write abandoned on cancellation"),
        }
    }

    async fn finish(&self, state: &mut SessionState, exit: Option<Exit>) -> SessionOutcome {
        state.advance(LoopPhase::Completing);
        let artifacts = state.artifacts();

        let (status, answer) = match exit {
            Some(Exit::Answer(answer)) => {
                (SessionStatus::Completed, with_artifacts(answer, &artifacts))
            }
            None => (
                SessionStatus::Incomplete,
                format!(
                    "{} {}",
                    EngineError::StepBudgetExhausted(self.settings.max_steps).user_hint(),
                    progress(state, &artifacts)
                ),
            ),
            Some(Exit::Stuck(call)) => (
                SessionStatus::Stuck,
                format!(
                    "{}: {}. {}",
                    EngineError::LoopDetected(call.to_string()).user_hint(),
                    call,
                    progress(state, &artifacts)
                ),
            ),
            Some(Exit::TooManyFailures) => (
                SessionStatus::Failed,
                format!(
                    "Task failed after {} consecutive tool failures. Last error: {}. {}",
                    state.consecutive_failures,
                    state.last_failure.as_deref().unwrap_or("unknown"),
                    progress(state, &artifacts)
                ),
            ),
            Some(Exit::Failed(e)) => {
                error!(session_id = %state.session_id, error = %e, "Session failed");
                (
                    SessionStatus::Failed,
                    format!("{}: {}. {}", e.user_hint(), e, progress(state, &artifacts)),
                )
            }
            Some(Exit::Cancelled) => (
                SessionStatus::Cancelled,
                format!(
                    "{}. {}",
                    EngineError::Cancelled.user_hint(),
                    progress(state, &artifacts)
                ),
            ),
        };

        // Recorded even after cancellation so the audit trail is complete
        let record = NewRecord::new(&state.session_id, RecordKind::FinalAnswer, answer.clone());
        if let Err(e) = self.memory.add(record).await {
            warn!(session_id = %state.session_id, error = %e, "Failed to store final answer");
        }

        state.terminal = true;
        state.advance(LoopPhase::Terminated);

        SessionOutcome {
            session_id: state.session_id.clone(),
            status,
            answer,
            steps: state.step_count,
            history: state.history.clone(),
            artifacts,
        }
    }
}

/// Race a future against cancellation
async fn guarded<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Result<T, EngineError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        value = fut => Ok(value),
    }
}

fn with_artifacts(answer: String, artifacts: &[String]) -> String {
    let missing: Vec<&String> = artifacts.iter().filter(|a| !answer.contains(a.as_str())).collect();
    if missing.is_empty() {
        return answer;
    }
    let links = missing
        .iter()
        .map(|a| format!("- {}", a))
        .collect::<Vec<_>>()
        .join("\n");
    format!("{}\n\nLinks:\n{}", answer.trim_end(), links)
}

fn progress(state: &SessionState, artifacts: &[String]) -> String {
    let done = state.completed_tools();
    let mut text = if done.is_empty() {
        "No tool completed successfully.".to_string()
    } else {
        format!("Completed: {}.", done.join(", "))
    };
    if !artifacts.is_empty() {
        text.push_str(&format!(" Links: {}", artifacts.join(", ")));
    }
    text
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}
