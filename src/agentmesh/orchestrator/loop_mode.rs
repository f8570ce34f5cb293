//! Loop discipline: one agent iterated until a predicate is satisfied.

use crate::agentmesh::agent::{AgentHandler, AgentResult};
use crate::agentmesh::context::AgentContext;
use crate::agentmesh::errors::ErrorInfo;
use crate::agentmesh::event::Event;
use crate::agentmesh::orchestrator::{run_handler, seed_state, AgentTable, Orchestrator, OrchestratorError};
use crate::agentmesh::retry::RetryPolicy;
use crate::agentmesh::state::State;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

/// Default iteration ceiling.
pub(crate) const DEFAULT_MAX_ITERATIONS: usize = 5;

/// Hard ceiling no configuration may exceed.
pub(crate) const MAX_ITERATIONS_CEILING: usize = 100;

/// Metadata key on the result state recording how many iterations ran.
pub const ITERATIONS_METADATA_KEY: &str = "iterations";

/// Termination predicate evaluated against each iteration's output state.
pub type LoopPredicate = Arc<dyn Fn(&State) -> bool + Send + Sync>;

/// Invokes a single handler repeatedly, feeding each iteration the
/// previous iteration's output state.
///
/// Iteration stops when the termination predicate returns `true`, when
/// `max_iterations` is reached (default 5, hard ceiling 100), or when the
/// handler fails non-retryably. Retryable failures re-run the same
/// iteration under the retry policy. The result is the last iteration's
/// output, with the metadata key `iterations` recording the count.
///
/// # Example
///
/// ```rust
/// use agentmesh::{
///     AgentContext, AgentHandler, AgentResult, Event, HandlerError,
///     LoopOrchestrator, Orchestrator, State,
/// };
/// use async_trait::async_trait;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// struct Counter;
///
/// #[async_trait]
/// impl AgentHandler for Counter {
///     async fn run(
///         &self,
///         _ctx: &AgentContext,
///         _event: &Event,
///         state: State,
///     ) -> Result<AgentResult, HandlerError> {
///         let mut out = state;
///         let n = out.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
///         out.set("n", json!(n + 1));
///         Ok(AgentResult::success(out))
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let orchestrator = LoopOrchestrator::new()
///     .with_max_iterations(10)
///     .with_predicate(Arc::new(|state| {
///         state.get("n").and_then(|v| v.as_i64()).unwrap_or(0) >= 3
///     }));
/// orchestrator.register_agent("counter", Arc::new(Counter)).unwrap();
///
/// let event = Event::new("count", json!({"n": 0}));
/// let result = orchestrator.dispatch(&AgentContext::new(), &event).await;
/// assert_eq!(result.output_state.get("n"), Some(&json!(3)));
/// assert_eq!(result.output_state.get_meta("iterations"), Some("3"));
/// # }
/// ```
pub struct LoopOrchestrator {
    agents: AgentTable,
    loop_agent: RwLock<Option<String>>,
    predicate: RwLock<Option<LoopPredicate>>,
    max_iterations: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl LoopOrchestrator {
    /// Create a loop orchestrator with the default iteration ceiling.
    pub fn new() -> Self {
        Self {
            agents: AgentTable::new(),
            loop_agent: RwLock::new(None),
            predicate: RwLock::new(None),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Select which registered agent is iterated (builder pattern).
    ///
    /// Defaults to the first registered agent.
    pub fn with_loop_agent(self, name: impl Into<String>) -> Self {
        if let Ok(mut agent) = self.loop_agent.write() {
            *agent = Some(name.into());
        }
        self
    }

    /// Set the termination predicate (builder pattern).
    ///
    /// Without a predicate the loop always runs to `max_iterations`.
    pub fn with_predicate(self, predicate: LoopPredicate) -> Self {
        if let Ok(mut slot) = self.predicate.write() {
            *slot = Some(predicate);
        }
        self
    }

    /// Set the iteration ceiling, clamped to the hard ceiling of 100
    /// (builder pattern).
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.min(MAX_ITERATIONS_CEILING);
        self
    }

    /// Set the per-iteration retry policy (builder pattern).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn selected_agent(&self) -> Option<String> {
        self.loop_agent
            .read()
            .ok()
            .and_then(|name| name.clone())
            .or_else(|| self.agents.names().first().cloned())
    }
}

impl Default for LoopOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Orchestrator for LoopOrchestrator {
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
        if self.max_iterations == 0 {
            return Err(OrchestratorError::NotConfigured(
                "max_iterations must be at least 1".into(),
            ));
        }
        if let Some(name) = self.loop_agent.read().ok().and_then(|n| n.clone()) {
            if self.agents.get(&name).is_none() {
                return Err(OrchestratorError::UnknownAgent(name));
            }
        }
        Ok(())
    }

    async fn dispatch(&self, ctx: &AgentContext, event: &Event) -> AgentResult {
        if self.max_iterations == 0 {
            return AgentResult::failure(ErrorInfo::validation(
                "loop dispatch with max_iterations of zero",
            ));
        }

        let Some(name) = self.selected_agent() else {
            return AgentResult::failure(ErrorInfo::validation(
                "loop dispatch with zero registered agents",
            ));
        };
        let Some(handler) = self.agents.get(&name) else {
            return AgentResult::failure(ErrorInfo::validation(format!(
                "loop agent '{}' is not registered",
                name
            )));
        };
        let predicate = self.predicate.read().ok().and_then(|p| p.clone());

        let mut state = seed_state(event);
        let mut iterations = 0usize;
        let mut last = AgentResult::success(state.clone());

        while iterations < self.max_iterations {
            if ctx.is_cancelled() || self.cancel.is_cancelled() {
                let mut cancelled = AgentResult::failure(ErrorInfo::cancelled(format!(
                    "loop cancelled after {} iterations",
                    iterations
                )));
                cancelled
                    .output_state
                    .set_meta(ITERATIONS_METADATA_KEY, iterations.to_string());
                return cancelled;
            }

            let mut attempt: u32 = 0;
            let result = loop {
                let result = run_handler(&name, &handler, ctx, event, state.clone()).await;
                match &result.error_info {
                    Some(info) if info.retryable && attempt < self.retry.max_retries => {
                        let delay = self.retry.delay(attempt);
                        attempt += 1;
                        log::warn!(
                            "loop iteration {} failed ({}), retry {}/{} in {:?}",
                            iterations + 1,
                            info,
                            attempt,
                            self.retry.max_retries,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    _ => break result,
                }
            };
            iterations += 1;

            if let Some(info) = &result.error_info {
                // Non-retryable (or exhausted) failure ends the loop.
                let mut failed = AgentResult::failure(info.clone().retryable(false));
                failed
                    .output_state
                    .set_meta(ITERATIONS_METADATA_KEY, iterations.to_string());
                return failed;
            }

            state = result.output_state.clone();
            last = result;

            if let Some(predicate) = &predicate {
                if predicate(&state) {
                    break;
                }
            }
        }

        last.output_state
            .set_meta(ITERATIONS_METADATA_KEY, iterations.to_string());
        last
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}
