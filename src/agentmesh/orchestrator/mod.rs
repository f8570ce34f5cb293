//! Orchestration disciplines.
//!
//! An orchestrator decides which registered agents receive an event and in
//! what order. Five disciplines ship with the crate, all satisfying the
//! same [`Orchestrator`] contract so the runner can treat them uniformly:
//!
//! | Discipline | Pattern | Parallelism |
//! |-----------|---------|-------------|
//! | [`RouteOrchestrator`] | One agent selected by `route` metadata | none |
//! | [`CollaborativeOrchestrator`] | All agents, outputs merged | bounded |
//! | [`SequentialOrchestrator`] | Declared pipeline, state piped | none |
//! | [`LoopOrchestrator`] | One agent iterated to a predicate | none |
//! | [`MixedOrchestrator`] | Static plan of groups and segments | per segment |
//!
//! Every dispatch moves through the same lifecycle:
//!
//! ```text
//! Queued ──► Running ──► Completed | Failed | Cancelled
//! ```
//!
//! `Cancelled` arises only from runner shutdown or context cancellation.

mod collaborative;
mod loop_mode;
mod mixed;
mod route;
mod sequential;

pub use collaborative::CollaborativeOrchestrator;
pub use loop_mode::{LoopOrchestrator, LoopPredicate, ITERATIONS_METADATA_KEY};
pub use mixed::{MixedOrchestrator, MixedPlan, PlanSegment};
pub use route::RouteOrchestrator;
pub use sequential::SequentialOrchestrator;

use crate::agentmesh::agent::{AgentHandler, AgentResult};
use crate::agentmesh::context::AgentContext;
use crate::agentmesh::errors::ErrorInfo;
use crate::agentmesh::event::Event;
use crate::agentmesh::state::State;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

/// Errors raised while configuring an orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorError {
    /// An agent with the same name is already registered.
    DuplicateAgent(String),
    /// A referenced agent name is not registered.
    UnknownAgent(String),
    /// The mixed plan is structurally invalid.
    InvalidPlan(String),
    /// The orchestrator is missing required configuration.
    NotConfigured(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::DuplicateAgent(name) => {
                write!(f, "agent '{}' is already registered", name)
            }
            OrchestratorError::UnknownAgent(name) => {
                write!(f, "agent '{}' is not registered", name)
            }
            OrchestratorError::InvalidPlan(msg) => write!(f, "invalid plan: {}", msg),
            OrchestratorError::NotConfigured(msg) => write!(f, "not configured: {}", msg),
        }
    }
}

impl Error for OrchestratorError {}

/// Lifecycle stage of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// Waiting in the runner queue.
    Queued,
    /// Being delivered to agents.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with a failure.
    Failed,
    /// Interrupted by shutdown or context cancellation.
    Cancelled,
}

impl DispatchStatus {
    /// Stable label used in trace entries.
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Queued => "Queued",
            DispatchStatus::Running => "Running",
            DispatchStatus::Completed => "Completed",
            DispatchStatus::Failed => "Failed",
            DispatchStatus::Cancelled => "Cancelled",
        }
    }

    /// Derive the terminal status of a finished dispatch from its result.
    pub fn of(result: &AgentResult) -> Self {
        match &result.error_info {
            None => DispatchStatus::Completed,
            Some(info) if info.message.contains("cancelled") => DispatchStatus::Cancelled,
            Some(_) => DispatchStatus::Failed,
        }
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The dispatch discipline contract.
///
/// Implementations keep their agent table behind interior mutability so a
/// shared `Arc<dyn Orchestrator>` can be registered against before the
/// runner starts.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Register a handler under a unique name.
    fn register_agent(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), OrchestratorError>;

    /// Registered agent names in registration order.
    fn agent_names(&self) -> Vec<String>;

    /// Look up a registered handler by name.
    fn agent(&self, name: &str) -> Option<Arc<dyn AgentHandler>>;

    /// Deliver one event according to the discipline.
    ///
    /// Failures are reported through the result's `error_info`, never by
    /// panicking or by a separate error channel.
    async fn dispatch(&self, ctx: &AgentContext, event: &Event) -> AgentResult;

    /// Check configuration consistency against the registered agents.
    ///
    /// Called by the runner at startup so misconfigurations surface before
    /// any dispatch.
    fn validate(&self) -> Result<(), OrchestratorError> {
        Ok(())
    }

    /// Signal cancellation to in-flight dispatches.
    fn stop(&self);
}

/// Name-keyed handler table preserving registration order.
pub(crate) struct AgentTable {
    inner: RwLock<AgentTableInner>,
}

struct AgentTableInner {
    agents: HashMap<String, Arc<dyn AgentHandler>>,
    order: Vec<String>,
}

impl AgentTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(AgentTableInner {
                agents: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    pub(crate) fn insert(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), OrchestratorError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| OrchestratorError::NotConfigured("agent table poisoned".into()))?;
        if inner.agents.contains_key(name) {
            return Err(OrchestratorError::DuplicateAgent(name.to_string()));
        }
        inner.order.push(name.to_string());
        inner.agents.insert(name.to_string(), handler);
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn AgentHandler>> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.agents.get(name).cloned())
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .map(|inner| inner.order.clone())
            .unwrap_or_default()
    }

    /// `(name, handler)` pairs in registration order.
    pub(crate) fn entries(&self) -> Vec<(String, Arc<dyn AgentHandler>)> {
        self.inner
            .read()
            .map(|inner| {
                inner
                    .order
                    .iter()
                    .filter_map(|name| {
                        inner
                            .agents
                            .get(name)
                            .map(|handler| (name.clone(), handler.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

}

/// Seed the dispatch state from an event: payload fields become data keys,
/// event metadata becomes state metadata.
pub(crate) fn seed_state(event: &Event) -> State {
    let mut state = State::from_payload(event.payload());
    for (key, value) in event.metadata() {
        state.set_meta(key.clone(), value.clone());
    }
    state
}

/// Run one handler with panic capture and error classification.
///
/// The returned result always satisfies the output-or-error invariant, even
/// when the handler panicked or returned a raw error.
pub(crate) async fn run_handler(
    name: &str,
    handler: &Arc<dyn AgentHandler>,
    ctx: &AgentContext,
    event: &Event,
    state: State,
) -> AgentResult {
    let start = Utc::now();
    let guarded = AssertUnwindSafe(handler.run(ctx, event, state)).catch_unwind();
    match guarded.await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            AgentResult::failure(ErrorInfo::classify(err.as_ref())).with_timing(start)
        }
        Err(panic) => AgentResult::failure(ErrorInfo::from_panic(name, &panic)).with_timing(start),
    }
}
