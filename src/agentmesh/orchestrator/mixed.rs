//! Mixed discipline: a static plan of collaborative groups and sequential
//! segments.

use crate::agentmesh::agent::{AgentHandler, AgentResult};
use crate::agentmesh::context::AgentContext;
use crate::agentmesh::errors::ErrorInfo;
use crate::agentmesh::event::Event;
use crate::agentmesh::orchestrator::collaborative::{
    merge_group, run_group, DEFAULT_CONCURRENCY_LIMIT, DEFAULT_FAILURE_THRESHOLD,
    DEFAULT_HANDLER_TIMEOUT,
};
use crate::agentmesh::orchestrator::{run_handler, seed_state, AgentTable, Orchestrator, OrchestratorError};
use crate::agentmesh::retry::RetryPolicy;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One stage of a [`MixedPlan`].
#[derive(Debug, Clone, PartialEq)]
pub enum PlanSegment {
    /// Agents run in parallel; their outputs merge before the next segment.
    Collaborative(Vec<String>),
    /// Agents run one after another, piping state.
    Sequential(Vec<String>),
}

impl PlanSegment {
    fn agent_names(&self) -> &[String] {
        match self {
            PlanSegment::Collaborative(names) | PlanSegment::Sequential(names) => names,
        }
    }
}

/// A static composition of collaborative groups and sequential segments.
///
/// Execution proceeds segment by segment: a collaborative segment blocks
/// until its merge completes, then passes the merged state to the next
/// segment.
///
/// # Example
///
/// ```rust
/// use agentmesh::{MixedPlan, PlanSegment};
///
/// let plan = MixedPlan::new(vec![
///     PlanSegment::Collaborative(vec!["research-a".into(), "research-b".into()]),
///     PlanSegment::Sequential(vec!["synthesize".into(), "publish".into()]),
/// ]);
/// assert!(plan.check_structure().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MixedPlan {
    /// Ordered segments.
    pub segments: Vec<PlanSegment>,
}

impl MixedPlan {
    /// Create a plan from ordered segments.
    pub fn new(segments: Vec<PlanSegment>) -> Self {
        Self { segments }
    }

    /// Structural validation that needs no agent table: the plan must be
    /// non-empty, every segment must name at least one agent, and no agent
    /// may appear twice (a repeated agent would make the segment graph
    /// cyclic).
    pub fn check_structure(&self) -> Result<(), OrchestratorError> {
        if self.segments.is_empty() {
            return Err(OrchestratorError::InvalidPlan("plan has no segments".into()));
        }
        let mut seen = HashSet::new();
        for (index, segment) in self.segments.iter().enumerate() {
            let names = segment.agent_names();
            if names.is_empty() {
                return Err(OrchestratorError::InvalidPlan(format!(
                    "segment {} names no agents",
                    index
                )));
            }
            for name in names {
                if !seen.insert(name.clone()) {
                    return Err(OrchestratorError::InvalidPlan(format!(
                        "agent '{}' appears more than once",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Full validation against a set of registered agent names.
    pub fn check_against(&self, registered: &[String]) -> Result<(), OrchestratorError> {
        self.check_structure()?;
        let known: HashSet<&str> = registered.iter().map(String::as_str).collect();
        for segment in &self.segments {
            for name in segment.agent_names() {
                if !known.contains(name.as_str()) {
                    return Err(OrchestratorError::UnknownAgent(name.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Executes a [`MixedPlan`] segment by segment.
///
/// Collaborative segments reuse the collaborative fan-out, concurrency
/// limit, timeout, and merge tie-break; sequential segments reuse the
/// per-step retry semantics. The plan is validated against the registered
/// agents at startup (see [`Orchestrator::validate`]), so
/// misconfigurations surface before any dispatch.
pub struct MixedOrchestrator {
    agents: AgentTable,
    plan: RwLock<Option<MixedPlan>>,
    concurrency_limit: usize,
    handler_timeout: Duration,
    failure_threshold: f64,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl MixedOrchestrator {
    /// Create a mixed orchestrator with no plan.
    pub fn new() -> Self {
        Self {
            agents: AgentTable::new(),
            plan: RwLock::new(None),
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Set the execution plan (builder pattern).
    ///
    /// Validity — structure and agent existence — is checked by
    /// [`Orchestrator::validate`], which the runner calls at startup once
    /// agents are registered.
    pub fn with_plan(self, plan: MixedPlan) -> Self {
        if let Ok(mut slot) = self.plan.write() {
            *slot = Some(plan);
        }
        self
    }

    /// Cap simultaneous executions inside collaborative segments (builder
    /// pattern).
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// Per-handler timeout inside collaborative segments (builder pattern).
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Failure threshold for collaborative segments (builder pattern).
    pub fn with_failure_threshold(mut self, threshold: f64) -> Self {
        self.failure_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Retry policy for sequential segments (builder pattern).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn current_plan(&self) -> Option<MixedPlan> {
        self.plan.read().ok().and_then(|p| p.clone())
    }
}

impl Default for MixedOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Orchestrator for MixedOrchestrator {
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
        match self.current_plan() {
            Some(plan) => plan.check_against(&self.agents.names()),
            None => Err(OrchestratorError::NotConfigured(
                "mixed orchestrator has no plan".into(),
            )),
        }
    }

    async fn dispatch(&self, ctx: &AgentContext, event: &Event) -> AgentResult {
        let Some(plan) = self.current_plan() else {
            return AgentResult::failure(ErrorInfo::validation(
                "mixed dispatch without a configured plan",
            ));
        };

        let mut state = seed_state(event);
        let mut last = AgentResult::success(state.clone());

        for segment in &plan.segments {
            if ctx.is_cancelled() || self.cancel.is_cancelled() {
                return AgentResult::failure(ErrorInfo::cancelled("dispatch cancelled"));
            }

            match segment {
                PlanSegment::Collaborative(names) => {
                    let mut participants = Vec::with_capacity(names.len());
                    for name in names {
                        let Some(handler) = self.agents.get(name) else {
                            return AgentResult::failure(ErrorInfo::validation(format!(
                                "plan references unregistered agent '{}'",
                                name
                            )));
                        };
                        participants.push((name.clone(), handler));
                    }

                    let completions = run_group(
                        participants,
                        ctx,
                        event,
                        &state,
                        self.concurrency_limit,
                        self.handler_timeout,
                        &self.cancel,
                    )
                    .await;
                    let merged = merge_group(completions, self.failure_threshold);
                    if merged.is_failure() {
                        return merged;
                    }
                    state = merged.output_state.clone();
                    last = merged;
                }
                PlanSegment::Sequential(names) => {
                    for name in names {
                        let Some(handler) = self.agents.get(name) else {
                            return AgentResult::failure(ErrorInfo::validation(format!(
                                "plan references unregistered agent '{}'",
                                name
                            )));
                        };

                        let mut attempt: u32 = 0;
                        let result = loop {
                            if ctx.is_cancelled() || self.cancel.is_cancelled() {
                                return AgentResult::failure(ErrorInfo::cancelled(
                                    "dispatch cancelled",
                                ));
                            }
                            let result =
                                run_handler(name, &handler, ctx, event, state.clone()).await;
                            match &result.error_info {
                                Some(info)
                                    if info.retryable && attempt < self.retry.max_retries =>
                                {
                                    let delay = self.retry.delay(attempt);
                                    attempt += 1;
                                    tokio::time::sleep(delay).await;
                                }
                                _ => break result,
                            }
                        };

                        if let Some(info) = &result.error_info {
                            let mut surfaced = result.clone();
                            surfaced.error_info = Some(info.clone().retryable(false));
                            return surfaced;
                        }
                        state = result.output_state.clone();
                        last = result;
                    }
                }
            }
        }

        last
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}
