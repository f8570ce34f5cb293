//! Collaborative discipline: fan-out to all agents, deterministic merge.

use crate::agentmesh::agent::{AgentHandler, AgentResult};
use crate::agentmesh::context::AgentContext;
use crate::agentmesh::errors::{ErrorInfo, ErrorSeverity};
use crate::agentmesh::event::Event;
use crate::agentmesh::orchestrator::{run_handler, seed_state, AgentTable, Orchestrator, OrchestratorError};
use crate::agentmesh::state::State;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

/// Default cap on simultaneously running handlers.
pub(crate) const DEFAULT_CONCURRENCY_LIMIT: usize = 10;

/// Default per-handler timeout.
pub(crate) const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Default fraction of failed handlers at which the dispatch fails.
pub(crate) const DEFAULT_FAILURE_THRESHOLD: f64 = 0.5;

/// Prefix marking namespaced keys that are never overwritten during merge.
const AGENT_NAMESPACE_PREFIX: &str = "agent:";

/// Prefix under which per-handler failures are recorded on partial success.
const ERRORS_KEY_PREFIX: &str = "errors:";

/// Invokes every registered handler in parallel for the same event and
/// merges their outputs into one state.
///
/// Each handler receives an independent clone of the seed state; a
/// semaphore caps simultaneous executions and a per-invocation timeout
/// classifies overruns as `Timeout`. The dispatch completes when all
/// handlers terminate.
///
/// # Merge semantics
///
/// Outputs merge in **completion order**: a later-completing handler's keys
/// overwrite earlier ones — except keys prefixed `agent:<name>:`, which are
/// namespaced per handler and never overwritten.
///
/// # Failure semantics
///
/// The dispatch fails iff the fraction of failed handlers reaches the
/// failure threshold (default 0.5). Below the threshold the dispatch
/// succeeds partially, with each failure recorded in the merged state
/// under `errors:<name>`.
pub struct CollaborativeOrchestrator {
    agents: AgentTable,
    participants: Vec<String>,
    concurrency_limit: usize,
    handler_timeout: Duration,
    failure_threshold: f64,
    cancel: CancellationToken,
}

impl CollaborativeOrchestrator {
    /// Create a collaborative orchestrator with default limits.
    pub fn new() -> Self {
        Self {
            agents: AgentTable::new(),
            participants: Vec::new(),
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cancel: CancellationToken::new(),
        }
    }

    /// Restrict the fan-out to a subset of registered agents (builder
    /// pattern). Empty means every registered agent participates.
    pub fn with_participants(mut self, participants: Vec<String>) -> Self {
        self.participants = participants;
        self
    }

    /// Cap the number of simultaneously running handlers (builder pattern).
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// Set the per-handler timeout (builder pattern).
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Set the failed-handler fraction at which the dispatch fails
    /// (builder pattern).
    pub fn with_failure_threshold(mut self, threshold: f64) -> Self {
        self.failure_threshold = threshold.clamp(0.0, 1.0);
        self
    }
}

impl Default for CollaborativeOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Orchestrator for CollaborativeOrchestrator {
    fn register_agent(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), OrchestratorError> {
        self.agents.insert(name, handler)
    }

    fn agent_names(&self) -> Vec<String> {
        self.agents.names()
    }

    fn agent(&self, name: &str) -> Option<Arc<dyn AgentHandler>> {
        self.agents.get(name)
    }

    fn validate(&self) -> Result<(), OrchestratorError> {
        for name in &self.participants {
            if self.agents.get(name).is_none() {
                return Err(OrchestratorError::UnknownAgent(name.clone()));
            }
        }
        Ok(())
    }

    async fn dispatch(&self, ctx: &AgentContext, event: &Event) -> AgentResult {
        let participants = if self.participants.is_empty() {
            self.agents.entries()
        } else {
            let mut selected = Vec::with_capacity(self.participants.len());
            for name in &self.participants {
                let Some(handler) = self.agents.get(name) else {
                    return AgentResult::failure(ErrorInfo::validation(format!(
                        "collaborative participant '{}' is not registered",
                        name
                    )));
                };
                selected.push((name.clone(), handler));
            }
            selected
        };
        if participants.is_empty() {
            return AgentResult::failure(ErrorInfo::validation(
                "collaborative dispatch with zero registered agents",
            ));
        }

        let seed = seed_state(event);
        let completions = run_group(
            participants,
            ctx,
            event,
            &seed,
            self.concurrency_limit,
            self.handler_timeout,
            &self.cancel,
        )
        .await;

        merge_group(completions, self.failure_threshold)
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Run a group of handlers in parallel, returning `(name, result)` pairs in
/// **completion order**.
///
/// Shared between the collaborative orchestrator and the collaborative
/// segments of the mixed orchestrator. Each spawned task clones the seed
/// state; panics inside a task surface as `Internal`/`Critical` results
/// rather than poisoning the dispatch.
pub(crate) async fn run_group(
    participants: Vec<(String, Arc<dyn AgentHandler>)>,
    ctx: &AgentContext,
    event: &Event,
    seed: &State,
    concurrency_limit: usize,
    handler_timeout: Duration,
    cancel: &CancellationToken,
) -> Vec<(String, AgentResult)> {
    let total = participants.len();
    let limit = Arc::new(Semaphore::new(concurrency_limit.max(1)));
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, AgentResult)>();

    for (name, handler) in participants {
        let tx = tx.clone();
        let limit = limit.clone();
        let ctx = ctx.clone();
        let event = event.clone();
        let state = seed.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let result = match limit.acquire_owned().await {
                Ok(_permit) => {
                    tokio::select! {
                        _ = ctx.cancellation().cancelled() => {
                            AgentResult::failure(ErrorInfo::cancelled(format!(
                                "handler '{}' cancelled",
                                name
                            )))
                        }
                        _ = cancel.cancelled() => {
                            AgentResult::failure(ErrorInfo::cancelled(format!(
                                "handler '{}' cancelled",
                                name
                            )))
                        }
                        run = tokio::time::timeout(
                            handler_timeout,
                            run_handler(&name, &handler, &ctx, &event, state),
                        ) => match run {
                            Ok(result) => result,
                            Err(_) => AgentResult::failure(ErrorInfo::timeout(format!(
                                "handler '{}' timed out after {:?}",
                                name, handler_timeout
                            ))),
                        },
                    }
                }
                Err(_) => AgentResult::failure(ErrorInfo::cancelled(format!(
                    "handler '{}' cancelled before start",
                    name
                ))),
            };
            let _ = tx.send((name, result));
        });
    }
    drop(tx);

    let mut completions = Vec::with_capacity(total);
    while let Some(completion) = rx.recv().await {
        completions.push(completion);
    }
    completions
}

/// Merge group completions into one dispatch result under the stated
/// tie-break and failure-threshold semantics.
pub(crate) fn merge_group(
    completions: Vec<(String, AgentResult)>,
    failure_threshold: f64,
) -> AgentResult {
    let total = completions.len();
    let mut merged = State::new();
    let mut failures: Vec<(String, ErrorInfo)> = Vec::new();
    let mut latest_start = None;

    for (name, result) in completions {
        if latest_start.is_none() {
            latest_start = Some(result.start_time);
        }
        match result.error_info {
            Some(info) => failures.push((name, info)),
            None => {
                for key in result.output_state.keys() {
                    // Namespaced keys win first-write; everything else is
                    // last-completion-wins.
                    if key.starts_with(AGENT_NAMESPACE_PREFIX) && merged.get(&key).is_some() {
                        continue;
                    }
                    if let Some(value) = result.output_state.get(&key) {
                        merged.set(key.clone(), value.clone());
                    }
                }
                for key in result.output_state.meta_keys() {
                    if let Some(value) = result.output_state.get_meta(&key) {
                        merged.set_meta(key.clone(), value.to_string());
                    }
                }
            }
        }
    }

    let failed_fraction = if total == 0 {
        0.0
    } else {
        failures.len() as f64 / total as f64
    };

    if !failures.is_empty() && failed_fraction >= failure_threshold {
        let worst = failures
            .iter()
            .max_by_key(|(_, info)| info.severity)
            .map(|(_, info)| info.clone())
            .unwrap_or_else(|| ErrorInfo::internal("collaborative dispatch failed"));
        let summary = ErrorInfo::new(
            worst.category,
            worst.severity.max(ErrorSeverity::High),
            format!(
                "{} of {} collaborative handlers failed (threshold {:.2})",
                failures.len(),
                total,
                failure_threshold
            ),
        )
        .retryable(worst.retryable)
        .with_cause(worst);
        return AgentResult::failure(summary);
    }

    for (name, info) in failures {
        let value = serde_json::to_value(&info)
            .unwrap_or_else(|_| serde_json::Value::String(info.to_string()));
        merged.set(format!("{}{}", ERRORS_KEY_PREFIX, name), value);
    }

    let start = latest_start.unwrap_or_else(chrono::Utc::now);
    AgentResult::success(merged).with_timing(start)
}
