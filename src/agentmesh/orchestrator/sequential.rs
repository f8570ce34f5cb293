//! Sequential discipline: a declared pipeline with per-step retries.

use crate::agentmesh::agent::{AgentHandler, AgentResult};
use crate::agentmesh::context::AgentContext;
use crate::agentmesh::errors::ErrorInfo;
use crate::agentmesh::event::Event;
use crate::agentmesh::orchestrator::{run_handler, seed_state, AgentTable, Orchestrator, OrchestratorError};
use crate::agentmesh::retry::RetryPolicy;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

/// Dispatches handlers one after another, piping each handler's output
/// state into its successor.
///
/// The first handler is seeded from the event payload; the final handler's
/// output is the dispatch result. The sequence stops on the first failure,
/// unless the failure is retryable and the retry policy has attempts left —
/// retries re-run only the failing step, never its predecessors. Once a
/// step's retries are exhausted, the surfaced error is marked
/// non-retryable so outer layers do not re-run the whole pipeline.
///
/// The pipeline order is the declared sequence
/// ([`with_sequence`](SequentialOrchestrator::with_sequence)), falling back
/// to registration order when none was declared.
pub struct SequentialOrchestrator {
    agents: AgentTable,
    sequence: RwLock<Vec<String>>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl SequentialOrchestrator {
    /// Create a sequential orchestrator with the default retry policy.
    pub fn new() -> Self {
        Self {
            agents: AgentTable::new(),
            sequence: RwLock::new(Vec::new()),
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Declare the pipeline order (builder pattern).
    pub fn with_sequence(self, sequence: Vec<String>) -> Self {
        if let Ok(mut declared) = self.sequence.write() {
            *declared = sequence;
        }
        self
    }

    /// Set the per-step retry policy (builder pattern).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn pipeline(&self) -> Vec<String> {
        let declared = self
            .sequence
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();
        if declared.is_empty() {
            self.agents.names()
        } else {
            declared
        }
    }
}

impl Default for SequentialOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Orchestrator for SequentialOrchestrator {
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
        for name in self.pipeline() {
            if self.agents.get(&name).is_none() {
                return Err(OrchestratorError::UnknownAgent(name));
            }
        }
        Ok(())
    }

    async fn dispatch(&self, ctx: &AgentContext, event: &Event) -> AgentResult {
        let pipeline = self.pipeline();
        if pipeline.is_empty() {
            return AgentResult::failure(ErrorInfo::validation(
                "sequential dispatch with zero registered agents",
            ));
        }

        let mut state = seed_state(event);
        let mut last = AgentResult::success(state.clone());

        for name in pipeline {
            let Some(handler) = self.agents.get(&name) else {
                return AgentResult::failure(ErrorInfo::validation(format!(
                    "sequence references unregistered agent '{}'",
                    name
                )));
            };

            let mut attempt: u32 = 0;
            last = loop {
                if ctx.is_cancelled() || self.cancel.is_cancelled() {
                    return AgentResult::failure(ErrorInfo::cancelled(format!(
                        "dispatch cancelled before step '{}'",
                        name
                    )));
                }

                let result = run_handler(&name, &handler, ctx, event, state.clone()).await;
                match &result.error_info {
                    None => break result,
                    Some(info) if info.retryable && attempt < self.retry.max_retries => {
                        let delay = self.retry.delay(attempt);
                        attempt += 1;
                        log::warn!(
                            "sequential step '{}' failed ({}), retry {}/{} in {:?}",
                            name,
                            info,
                            attempt,
                            self.retry.max_retries,
                            delay
                        );
                        tokio::select! {
                            _ = ctx.cancellation().cancelled() => {
                                return AgentResult::failure(ErrorInfo::cancelled(format!(
                                    "dispatch cancelled while retrying step '{}'",
                                    name
                                )));
                            }
                            _ = self.cancel.cancelled() => {
                                return AgentResult::failure(ErrorInfo::cancelled(format!(
                                    "dispatch cancelled while retrying step '{}'",
                                    name
                                )));
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Some(info) => {
                        // Exhausted or non-retryable: surface as final, and
                        // strip retryability so outer layers do not re-run
                        // the completed prefix of the pipeline.
                        let mut surfaced = result.clone();
                        surfaced.error_info = Some(info.clone().retryable(false));
                        return surfaced;
                    }
                }
            };

            state = last.output_state.clone();
        }

        last
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}
