//! Agent handler contract and the memory-aware wrapper.
//!
//! An agent in agentmesh is a named unit of work implementing
//! [`AgentHandler`]: a pure async function from `(ctx, event, state)` to an
//! [`AgentResult`]. There is no inheritance hierarchy — orchestration
//! behavior is achieved by composing handlers through the dispatch
//! disciplines, and cross-cutting concerns are layered on with the
//! [`MemoryAwareHandler`] decorator the runner applies once at registration
//! time.
//!
//! ```text
//! orchestrator ──► MemoryAwareHandler
//!                    ├─ BeforeAgentRun hook (state piped through callbacks)
//!                    ├─ context injection (memory + session id)
//!                    ├─ inner handler (panics caught, errors classified)
//!                    └─ AfterAgentRun hook (output + error visible)
//! ```
//!
//! # Writing a handler
//!
//! ```rust
//! use agentmesh::{AgentContext, AgentHandler, AgentResult, Event, HandlerError, State};
//! use async_trait::async_trait;
//! use serde_json::json;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl AgentHandler for Echo {
//!     async fn run(
//!         &self,
//!         _ctx: &AgentContext,
//!         _event: &Event,
//!         state: State,
//!     ) -> Result<AgentResult, HandlerError> {
//!         let mut out = state;
//!         let msg = out.get("msg").cloned().unwrap_or(json!(""));
//!         out.set("out", msg);
//!         Ok(AgentResult::success(out))
//!     }
//! }
//! ```
//!
//! Handlers must not retain references to the input state after returning;
//! the runtime clones state at every agent boundary and treats the returned
//! result as the only surviving view.

use crate::agentmesh::callbacks::{CallbackArgs, CallbackRegistry, HookPoint};
use crate::agentmesh::context::AgentContext;
use crate::agentmesh::errors::ErrorInfo;
use crate::agentmesh::event::Event;
use crate::agentmesh::memory::Memory;
use crate::agentmesh::state::State;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use std::error::Error;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Open error seam for handler implementations.
///
/// Handlers may return any error; the runtime classifies it into an
/// [`ErrorInfo`] (an error that already *is* an `ErrorInfo` passes through
/// verbatim).
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// The uniform agent contract: `(ctx, event, state) → result`.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Process one event with the given input state.
    ///
    /// Returning `Err` is equivalent to returning a result carrying the
    /// classified [`ErrorInfo`].
    async fn run(
        &self,
        ctx: &AgentContext,
        event: &Event,
        state: State,
    ) -> Result<AgentResult, HandlerError>;
}

/// Outcome of one agent run: output state or a classified failure, plus
/// timing.
///
/// A completed run always has either a non-empty output state or an
/// `error_info` — never neither.
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// State produced by the agent (empty on failure).
    pub output_state: State,
    /// The classified failure, when the run did not succeed.
    pub error_info: Option<ErrorInfo>,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// When the run finished.
    pub end_time: DateTime<Utc>,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl AgentResult {
    /// A successful result carrying the given output state.
    pub fn success(output_state: State) -> Self {
        let now = Utc::now();
        Self {
            output_state,
            error_info: None,
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
        }
    }

    /// A failed result carrying the given error.
    pub fn failure(error_info: ErrorInfo) -> Self {
        let now = Utc::now();
        Self {
            output_state: State::new(),
            error_info: Some(error_info),
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
        }
    }

    /// `true` when the run failed.
    pub fn is_failure(&self) -> bool {
        self.error_info.is_some()
    }

    /// Re-stamp timing against an externally measured start (builder
    /// pattern).
    pub fn with_timing(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = start;
        self.end_time = Utc::now();
        self.duration = (self.end_time - self.start_time)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self
    }
}

/// Decorator the runner wraps around every registered handler.
///
/// The wrapper owns the per-agent pipeline: it fires the
/// `BeforeAgentRun`/`AfterAgentRun` hooks (piping callback-returned state
/// into the handler), guarantees the context carries the shared memory
/// handle and a session id, converts panics into
/// `Internal`/`Critical` failures, classifies raw handler errors, and
/// stamps timing. Orchestrators stay hook-agnostic: they call the wrapped
/// handler like any other.
pub struct MemoryAwareHandler {
    name: String,
    inner: Arc<dyn AgentHandler>,
    callbacks: Arc<CallbackRegistry>,
    memory: Option<Arc<dyn Memory>>,
}

impl MemoryAwareHandler {
    /// Wrap a handler under the given registered name.
    pub fn new(
        name: impl Into<String>,
        inner: Arc<dyn AgentHandler>,
        callbacks: Arc<CallbackRegistry>,
        memory: Option<Arc<dyn Memory>>,
    ) -> Self {
        Self {
            name: name.into(),
            inner,
            callbacks,
            memory,
        }
    }

    /// The registered agent name this wrapper serves.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl AgentHandler for MemoryAwareHandler {
    async fn run(
        &self,
        ctx: &AgentContext,
        event: &Event,
        state: State,
    ) -> Result<AgentResult, HandlerError> {
        let start = Utc::now();

        let before = CallbackArgs::new(HookPoint::BeforeAgentRun, event.clone(), state)
            .with_agent(self.name.clone());
        let outcome = self.callbacks.invoke(HookPoint::BeforeAgentRun, before).await;
        let input_state = outcome.state;

        // Guarantee memory and session are visible to the handler even when
        // the orchestrator is driven outside a runner.
        let mut run_ctx = ctx.clone();
        if run_ctx.memory().is_none() {
            if let Some(memory) = &self.memory {
                run_ctx = run_ctx.with_memory(memory.clone());
            }
        }
        if run_ctx.session_id().is_empty() {
            if let Some(session) = event.session_id() {
                run_ctx = run_ctx.with_session(session);
            }
        }

        let guarded = AssertUnwindSafe(self.inner.run(&run_ctx, event, input_state.clone()))
            .catch_unwind();
        let result = match guarded.await {
            Ok(Ok(result)) => result.with_timing(start),
            Ok(Err(err)) => {
                AgentResult::failure(ErrorInfo::classify(err.as_ref())).with_timing(start)
            }
            Err(panic) => {
                log::error!("agent '{}' panicked during run", self.name);
                AgentResult::failure(ErrorInfo::from_panic(&self.name, &panic)).with_timing(start)
            }
        };

        let mut after = CallbackArgs::new(HookPoint::AfterAgentRun, event.clone(), input_state)
            .with_agent(self.name.clone())
            .with_output(result.output_state.clone());
        if let Some(error) = &result.error_info {
            after = after.with_error(error.clone());
        }
        self.callbacks.invoke(HookPoint::AfterAgentRun, after).await;

        Ok(result)
    }
}
