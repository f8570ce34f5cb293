//! Hook-based callback registry.
//!
//! Cross-cutting concerns — tracing, memory injection, error rewriting —
//! observe and reshape a dispatch through callbacks registered at six
//! well-known hook points, plus the pseudo-hook [`HookPoint::All`] which
//! fires for every concrete hook after the hook-specific callbacks.
//!
//! ```text
//! Emit ──► BeforeEventHandling
//!            └─ per selected agent:
//!                 BeforeAgentRun ──► handler ──► AfterAgentRun
//!                   (BeforeLlmCall / AfterLlmCall fired by model-calling
//!                    handlers around their provider round-trips)
//!          AfterEventHandling
//! ```
//!
//! Callbacks in one firing form a pipeline: each receives the state returned
//! by its predecessor and may return a replacement. A callback error is
//! logged to the trace and otherwise ignored, unless its severity is
//! `Critical`, which aborts the remaining callbacks of that firing.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::{Callback, CallbackArgs, CallbackRegistry, ErrorInfo, HookPoint, State};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Stamp;
//!
//! #[async_trait]
//! impl Callback for Stamp {
//!     async fn on_hook(&self, args: &CallbackArgs) -> Result<Option<State>, ErrorInfo> {
//!         let mut state = args.state.clone();
//!         state.set_meta("stamped", "yes");
//!         Ok(Some(state))
//!     }
//! }
//!
//! let registry = CallbackRegistry::new();
//! registry.register(HookPoint::BeforeAgentRun, "stamp", Arc::new(Stamp));
//! ```

use crate::agentmesh::errors::ErrorInfo;
use crate::agentmesh::event::Event;
use crate::agentmesh::state::State;
use crate::agentmesh::trace::{summarize_state, TraceEntry, TraceLogger};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Session label used in trace entries when an event carries no session.
pub(crate) const DEFAULT_SESSION: &str = "default";

/// The six well-known hook points, plus the [`All`](HookPoint::All)
/// pseudo-hook that fires for every concrete hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Before the orchestrator dispatches a dequeued event.
    BeforeEventHandling,
    /// After the dispatch completed (successfully or not).
    AfterEventHandling,
    /// Before an individual agent handler runs.
    BeforeAgentRun,
    /// After an individual agent handler returned.
    AfterAgentRun,
    /// Before a model provider round-trip. Fired by model-calling handlers,
    /// not by the core runtime itself.
    BeforeLlmCall,
    /// After a model provider round-trip. Fired by model-calling handlers.
    AfterLlmCall,
    /// Pseudo-hook: callbacks registered here fire for every concrete hook,
    /// after any hook-specific callbacks.
    All,
}

impl HookPoint {
    /// The six concrete hook points, in pipeline order.
    pub const CONCRETE: [HookPoint; 6] = [
        HookPoint::BeforeEventHandling,
        HookPoint::AfterEventHandling,
        HookPoint::BeforeAgentRun,
        HookPoint::AfterAgentRun,
        HookPoint::BeforeLlmCall,
        HookPoint::AfterLlmCall,
    ];

    /// Stable string label used in trace entries.
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::BeforeEventHandling => "before_event_handling",
            HookPoint::AfterEventHandling => "after_event_handling",
            HookPoint::BeforeAgentRun => "before_agent_run",
            HookPoint::AfterAgentRun => "after_agent_run",
            HookPoint::BeforeLlmCall => "before_llm_call",
            HookPoint::AfterLlmCall => "after_llm_call",
            HookPoint::All => "all",
        }
    }

    fn index(self) -> usize {
        match self {
            HookPoint::BeforeEventHandling => 0,
            HookPoint::AfterEventHandling => 1,
            HookPoint::BeforeAgentRun => 2,
            HookPoint::AfterAgentRun => 3,
            HookPoint::BeforeLlmCall => 4,
            HookPoint::AfterLlmCall => 5,
            HookPoint::All => 6,
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// In-flight values handed to every callback of a firing.
///
/// `state` is the pipeline input: it reflects the state returned by the
/// previous callback of the same firing. `output` and `error` are set for
/// after-hooks, carrying the agent's output state and failure if any.
#[derive(Debug, Clone)]
pub struct CallbackArgs {
    /// Which hook is firing.
    pub hook: HookPoint,
    /// The event being dispatched.
    pub event: Event,
    /// Name of the agent involved, for agent-scoped hooks.
    pub agent_name: Option<String>,
    /// Pipeline input state.
    pub state: State,
    /// The agent's output state, for after-hooks.
    pub output: Option<State>,
    /// The failure carried by this firing, if any.
    pub error: Option<ErrorInfo>,
}

impl CallbackArgs {
    /// Create args for a firing with the given hook, event, and input state.
    pub fn new(hook: HookPoint, event: Event, state: State) -> Self {
        Self {
            hook,
            event,
            agent_name: None,
            state,
            output: None,
            error: None,
        }
    }

    /// Attach the involved agent's name (builder pattern).
    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    /// Attach the agent's output state (builder pattern).
    pub fn with_output(mut self, output: State) -> Self {
        self.output = Some(output);
        self
    }

    /// Attach a failure (builder pattern).
    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    /// Session id of the underlying event, or the default session label.
    pub fn session_id(&self) -> &str {
        self.event.session_id().unwrap_or(DEFAULT_SESSION)
    }
}

/// A hook callback.
///
/// Returning `Ok(Some(state))` replaces the pipeline state for subsequent
/// callbacks of the same firing; `Ok(None)` leaves it untouched. Errors are
/// recorded in the trace; only a `Critical` error aborts the firing.
#[async_trait]
pub trait Callback: Send + Sync {
    /// Invoked once per firing of a hook this callback is registered at.
    async fn on_hook(&self, args: &CallbackArgs) -> Result<Option<State>, ErrorInfo>;
}

/// Future type returned by [`FnCallback`] closures.
pub type CallbackFuture = BoxFuture<'static, Result<Option<State>, ErrorInfo>>;

/// Adapter registering a plain closure as a [`Callback`].
///
/// # Example
///
/// ```rust
/// use agentmesh::{CallbackRegistry, FnCallback, HookPoint};
/// use std::sync::Arc;
///
/// let registry = CallbackRegistry::new();
/// registry.register(
///     HookPoint::AfterAgentRun,
///     "observer",
///     Arc::new(FnCallback::new(|args| {
///         Box::pin(async move {
///             log::debug!("agent {:?} finished", args.agent_name);
///             Ok(None)
///         })
///     })),
/// );
/// ```
pub struct FnCallback<F>
where
    F: Fn(CallbackArgs) -> CallbackFuture + Send + Sync,
{
    func: F,
}

impl<F> FnCallback<F>
where
    F: Fn(CallbackArgs) -> CallbackFuture + Send + Sync,
{
    /// Wrap a closure as a callback.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> Callback for FnCallback<F>
where
    F: Fn(CallbackArgs) -> CallbackFuture + Send + Sync,
{
    async fn on_hook(&self, args: &CallbackArgs) -> Result<Option<State>, ErrorInfo> {
        (self.func)(args.clone()).await
    }
}

#[derive(Clone)]
struct NamedCallback {
    name: String,
    callback: Arc<dyn Callback>,
}

/// Outcome of one hook firing.
#[derive(Debug)]
pub struct InvokeOutcome {
    /// Final pipeline state after all callbacks ran.
    pub state: State,
    /// Non-fatal callback errors collected during the firing.
    pub errors: Vec<ErrorInfo>,
    /// `true` when a `Critical` callback error aborted the firing early.
    pub aborted: bool,
}

/// Ordered, thread-safe registry of callbacks per hook point.
///
/// Registration order is invocation order; registering under an existing
/// name replaces the callback in place without changing its position.
/// Each hook point has its own lock, so registering at one hook never
/// blocks in-flight invocations of another; invocation snapshots the
/// callback list and runs without holding any lock.
pub struct CallbackRegistry {
    hooks: [RwLock<Vec<NamedCallback>>; 7],
    trace: Option<Arc<dyn TraceLogger>>,
}

impl CallbackRegistry {
    /// Create an empty registry with no trace logger attached.
    pub fn new() -> Self {
        Self {
            hooks: std::array::from_fn(|_| RwLock::new(Vec::new())),
            trace: None,
        }
    }

    /// Attach a trace logger so every firing and callback error is recorded
    /// (builder pattern).
    pub fn with_trace_logger(mut self, trace: Arc<dyn TraceLogger>) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Register a callback at a hook point, appending or replacing by name.
    pub fn register(&self, hook: HookPoint, name: impl Into<String>, callback: Arc<dyn Callback>) {
        let name = name.into();
        if let Ok(mut callbacks) = self.hooks[hook.index()].write() {
            if let Some(existing) = callbacks.iter_mut().find(|c| c.name == name) {
                existing.callback = callback;
            } else {
                callbacks.push(NamedCallback { name, callback });
            }
        }
    }

    /// Remove the named callback from a hook point.
    ///
    /// Returns `true` when a callback was removed.
    pub fn unregister(&self, hook: HookPoint, name: &str) -> bool {
        if let Ok(mut callbacks) = self.hooks[hook.index()].write() {
            let before = callbacks.len();
            callbacks.retain(|c| c.name != name);
            return callbacks.len() != before;
        }
        false
    }

    /// Number of callbacks registered at a hook point.
    pub fn callback_count(&self, hook: HookPoint) -> usize {
        self.hooks[hook.index()]
            .read()
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Fire a hook: run each registered callback in order, piping the state.
    ///
    /// Callbacks registered at [`HookPoint::All`] run after the
    /// hook-specific ones. Non-critical callback errors are collected (and
    /// traced) without interrupting the chain; a `Critical` error stops the
    /// firing. One trace entry is recorded per firing when a trace logger
    /// is attached.
    pub async fn invoke(&self, hook: HookPoint, mut args: CallbackArgs) -> InvokeOutcome {
        args.hook = hook;

        // Snapshot under the read lock, run lock-free.
        let mut snapshot: Vec<NamedCallback> = self.hooks[hook.index()]
            .read()
            .map(|c| c.clone())
            .unwrap_or_default();
        if hook != HookPoint::All {
            if let Ok(all) = self.hooks[HookPoint::All.index()].read() {
                snapshot.extend(all.iter().cloned());
            }
        }

        let mut errors = Vec::new();
        let mut aborted = false;

        for named in &snapshot {
            match named.callback.on_hook(&args).await {
                Ok(Some(state)) => args.state = state,
                Ok(None) => {}
                Err(info) => {
                    self.trace_callback_error(&args, &named.name, &info);
                    let critical = info.is_critical();
                    errors.push(info);
                    if critical {
                        aborted = true;
                        break;
                    }
                }
            }
        }

        self.trace_firing(&args);

        InvokeOutcome {
            state: args.state,
            errors,
            aborted,
        }
    }

    fn trace_firing(&self, args: &CallbackArgs) {
        let Some(trace) = &self.trace else { return };

        let mut entry = TraceEntry::new(args.session_id(), args.event.id(), args.hook.as_str());
        if let Some(agent) = &args.agent_name {
            entry = entry.with_agent(agent.clone());
        }
        if let Some(error) = &args.error {
            entry = entry.with_error(error.to_string());
        }
        let summary_source = args.output.as_ref().unwrap_or(&args.state);
        if !summary_source.is_empty() {
            entry = entry.with_result(summarize_state(summary_source));
        }
        trace.log(entry);
    }

    fn trace_callback_error(&self, args: &CallbackArgs, name: &str, info: &ErrorInfo) {
        let Some(trace) = &self.trace else { return };

        let mut entry = TraceEntry::new(args.session_id(), args.event.id(), args.hook.as_str())
            .with_error(format!("callback '{}' failed: {}", name, info));
        if let Some(agent) = &args.agent_name {
            entry = entry.with_agent(agent.clone());
        }
        trace.log(entry);
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::errors::{ErrorCategory, ErrorSeverity};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        calls: Arc<AtomicUsize>,
        tag: &'static str,
    }

    #[async_trait]
    impl Callback for Recorder {
        async fn on_hook(&self, args: &CallbackArgs) -> Result<Option<State>, ErrorInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut state = args.state.clone();
            let mut order = state
                .get("order")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            order.push_str(self.tag);
            state.set("order", json!(order));
            Ok(Some(state))
        }
    }

    fn args() -> CallbackArgs {
        CallbackArgs::new(
            HookPoint::BeforeAgentRun,
            Event::new("t", json!(null)).with_session("s"),
            State::new(),
        )
    }

    #[tokio::test]
    async fn callbacks_run_in_registration_order_and_pipe_state() {
        let registry = CallbackRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(
            HookPoint::BeforeAgentRun,
            "first",
            Arc::new(Recorder { calls: calls.clone(), tag: "a" }),
        );
        registry.register(
            HookPoint::BeforeAgentRun,
            "second",
            Arc::new(Recorder { calls: calls.clone(), tag: "b" }),
        );

        let outcome = registry.invoke(HookPoint::BeforeAgentRun, args()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.state.get("order"), Some(&json!("ab")));
    }

    #[tokio::test]
    async fn register_replaces_by_name_in_place() {
        let registry = CallbackRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(
            HookPoint::BeforeAgentRun,
            "x",
            Arc::new(Recorder { calls: calls.clone(), tag: "old" }),
        );
        registry.register(
            HookPoint::BeforeAgentRun,
            "tail",
            Arc::new(Recorder { calls: calls.clone(), tag: "t" }),
        );
        registry.register(
            HookPoint::BeforeAgentRun,
            "x",
            Arc::new(Recorder { calls: calls.clone(), tag: "new" }),
        );

        let outcome = registry.invoke(HookPoint::BeforeAgentRun, args()).await;
        assert_eq!(outcome.state.get("order"), Some(&json!("newt")));
        assert_eq!(registry.callback_count(HookPoint::BeforeAgentRun), 2);
    }

    #[tokio::test]
    async fn unregister_restores_pre_registration_behavior() {
        let registry = CallbackRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(
            HookPoint::BeforeAgentRun,
            "temp",
            Arc::new(Recorder { calls: calls.clone(), tag: "x" }),
        );
        assert!(registry.unregister(HookPoint::BeforeAgentRun, "temp"));
        assert!(!registry.unregister(HookPoint::BeforeAgentRun, "temp"));

        registry.invoke(HookPoint::BeforeAgentRun, args()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_hook_fires_after_specific() {
        let registry = CallbackRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(
            HookPoint::All,
            "everywhere",
            Arc::new(Recorder { calls: calls.clone(), tag: "A" }),
        );
        registry.register(
            HookPoint::BeforeAgentRun,
            "specific",
            Arc::new(Recorder { calls: calls.clone(), tag: "s" }),
        );

        let outcome = registry.invoke(HookPoint::BeforeAgentRun, args()).await;
        assert_eq!(outcome.state.get("order"), Some(&json!("sA")));

        let outcome = registry
            .invoke(
                HookPoint::AfterEventHandling,
                CallbackArgs::new(
                    HookPoint::AfterEventHandling,
                    Event::new("t", json!(null)),
                    State::new(),
                ),
            )
            .await;
        assert_eq!(outcome.state.get("order"), Some(&json!("A")));
    }

    struct Failing {
        severity: ErrorSeverity,
    }

    #[async_trait]
    impl Callback for Failing {
        async fn on_hook(&self, _args: &CallbackArgs) -> Result<Option<State>, ErrorInfo> {
            Err(ErrorInfo::new(
                ErrorCategory::Internal,
                self.severity,
                "callback exploded",
            ))
        }
    }

    #[tokio::test]
    async fn non_critical_errors_do_not_abort_the_chain() {
        let registry = CallbackRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(
            HookPoint::BeforeAgentRun,
            "bad",
            Arc::new(Failing { severity: ErrorSeverity::Medium }),
        );
        registry.register(
            HookPoint::BeforeAgentRun,
            "good",
            Arc::new(Recorder { calls: calls.clone(), tag: "g" }),
        );

        let outcome = registry.invoke(HookPoint::BeforeAgentRun, args()).await;
        assert_eq!(outcome.errors.len(), 1);
        assert!(!outcome.aborted);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn critical_error_aborts_remaining_callbacks() {
        let registry = CallbackRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(
            HookPoint::BeforeAgentRun,
            "fatal",
            Arc::new(Failing { severity: ErrorSeverity::Critical }),
        );
        registry.register(
            HookPoint::BeforeAgentRun,
            "never",
            Arc::new(Recorder { calls: calls.clone(), tag: "n" }),
        );

        let outcome = registry.invoke(HookPoint::BeforeAgentRun, args()).await;
        assert!(outcome.aborted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
