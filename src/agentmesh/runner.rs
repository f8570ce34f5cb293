//! The event runner: queue, worker pool, lifecycle, and wiring.
//!
//! [`Runner`] owns the bounded event queue, a symmetric worker pool, the
//! callback registry, the trace logger, and the active orchestrator. It is
//! the only entry point embedders need:
//!
//! ```text
//! producers ──► emit ──► bounded queue ──► worker pool
//!                                             │ per event:
//!                                             │  BeforeEventHandling hook
//!                                             │  context (memory + session)
//!                                             │  orchestrator dispatch
//!                                             │    (timeout + retry policy)
//!                                             │  AfterEventHandling hook
//!                                             └─ error routing (try-send)
//! ```
//!
//! # Lifecycle
//!
//! `Idle → Running → Stopping → Stopped`. [`Runner::start`] spawns the
//! workers and rejects a double start; [`Runner::stop`] closes the queue,
//! cancels the root context, grants in-flight handlers a grace period, and
//! is idempotent. Agents register only while not running.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmesh::{
//!     AgentContext, AgentHandler, AgentResult, Event, HandlerError, Runner,
//!     RunnerConfig, State,
//! };
//! use async_trait::async_trait;
//! use serde_json::json;
//! use std::sync::Arc;
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
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runner = Runner::new(RunnerConfig::default())?;
//! runner.register_agent("echo", Arc::new(Echo))?;
//! runner.start()?;
//!
//! runner
//!     .emit(
//!         Event::new("user_message", json!({"msg": "hi"}))
//!             .with_metadata("route", "echo")
//!             .with_session("s-1"),
//!     )
//!     .await?;
//!
//! runner.stop().await?;
//! for entry in runner.dump_trace("s-1")? {
//!     println!("{} {:?}", entry.hook, entry.agent_name);
//! }
//! # Ok(())
//! # }
//! ```

use crate::agentmesh::agent::{AgentHandler, AgentResult, MemoryAwareHandler};
use crate::agentmesh::callbacks::{Callback, CallbackArgs, CallbackRegistry, HookPoint};
use crate::agentmesh::config::{ConfigError, OrchestrationMode, RunnerConfig};
use crate::agentmesh::context::AgentContext;
use crate::agentmesh::error_router::{ErrorRouter, RouteDecision};
use crate::agentmesh::errors::ErrorInfo;
use crate::agentmesh::event::Event;
use crate::agentmesh::memory::Memory;
use crate::agentmesh::orchestrator::{
    run_handler, seed_state, CollaborativeOrchestrator, DispatchStatus, LoopOrchestrator,
    MixedOrchestrator, Orchestrator, RouteOrchestrator, SequentialOrchestrator,
};
use crate::agentmesh::retry::RetryPolicy;
use crate::agentmesh::state::ROUTE_METADATA_KEY;
use crate::agentmesh::trace::{
    trace_file_name, write_trace_file, InMemoryTraceLogger, TraceEntry, TraceLogger,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Trace label for dispatch outcomes.
pub const TRACE_HOOK_DISPATCH: &str = "dispatch";

/// Trace label for runner-level retries.
pub const TRACE_HOOK_RETRY: &str = "retry";

/// Trace label for error-router decisions.
pub const TRACE_HOOK_ERROR_ROUTER: &str = "error_router";

/// Trace label for circuit-breaker trips.
pub const TRACE_HOOK_CIRCUIT_BREAKER: &str = "circuit_breaker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunnerStatus {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl RunnerStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RunnerStatus::Idle => "idle",
            RunnerStatus::Running => "running",
            RunnerStatus::Stopping => "stopping",
            RunnerStatus::Stopped => "stopped",
        }
    }
}

/// Everything a worker needs, shared across the pool.
struct WorkerShared {
    orchestrator: Arc<dyn Orchestrator>,
    callbacks: Arc<CallbackRegistry>,
    trace: Arc<dyn TraceLogger>,
    memory: Option<Arc<dyn Memory>>,
    router: Arc<ErrorRouter>,
    // Weak so worker-held handles never keep the queue alive past stop().
    emitter: mpsc::WeakSender<Event>,
    cancel: CancellationToken,
    default_session: String,
    dispatch_timeout: Duration,
    retry: RetryPolicy,
}

/// Event-driven scheduler tying the queue, workers, hooks, memory plane,
/// and error routing together.
pub struct Runner {
    config: RunnerConfig,
    orchestrator: Arc<dyn Orchestrator>,
    callbacks: Arc<CallbackRegistry>,
    trace: Arc<dyn TraceLogger>,
    memory: Option<Arc<dyn Memory>>,
    router: Arc<ErrorRouter>,
    default_session: String,
    status: Mutex<RunnerStatus>,
    sender: Mutex<Option<mpsc::Sender<Event>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
    receiver: AsyncMutex<Option<Arc<AsyncMutex<mpsc::Receiver<Event>>>>>,
}

impl Runner {
    /// Create a runner from a validated configuration.
    ///
    /// The orchestrator is built from `config.orchestration.mode`; replace
    /// it with [`with_orchestrator`](Runner::with_orchestrator) when you
    /// need a custom discipline or a loop predicate. Builder methods must
    /// be applied before registering agents or callbacks.
    pub fn new(config: RunnerConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let trace: Arc<dyn TraceLogger> = Arc::new(InMemoryTraceLogger::new());
        let callbacks = Arc::new(CallbackRegistry::new().with_trace_logger(trace.clone()));
        let orchestrator = build_orchestrator(&config);
        let router = Arc::new(ErrorRouter::new(config.error_routing.clone()));
        let default_session = config
            .session_id
            .clone()
            .unwrap_or_else(|| format!("session-{}", Uuid::new_v4()));

        Ok(Self {
            config,
            orchestrator,
            callbacks,
            trace,
            memory: None,
            router,
            default_session,
            status: Mutex::new(RunnerStatus::Idle),
            sender: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            cancel: Mutex::new(CancellationToken::new()),
            receiver: AsyncMutex::new(None),
        })
    }

    /// Attach the shared memory handle injected into every agent context
    /// (builder pattern). The handle is closed when the runner stops.
    pub fn with_memory(mut self, memory: Arc<dyn Memory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Replace the configuration-built orchestrator (builder pattern).
    pub fn with_orchestrator(mut self, orchestrator: Arc<dyn Orchestrator>) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    /// Replace the trace logger (builder pattern).
    ///
    /// Also rebuilds the callback registry around the new logger, so call
    /// this before registering callbacks.
    pub fn with_trace_logger(mut self, trace: Arc<dyn TraceLogger>) -> Self {
        self.trace = trace.clone();
        self.callbacks = Arc::new(CallbackRegistry::new().with_trace_logger(trace));
        self
    }

    /// Register an agent handler under a unique name.
    ///
    /// The handler is wrapped once with [`MemoryAwareHandler`], which fires
    /// the per-agent hooks, injects memory and session into the context,
    /// and converts panics into classified failures. Registration is
    /// rejected while the runner is running.
    pub fn register_agent(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), ErrorInfo> {
        let status = self.current_status();
        if status == RunnerStatus::Running || status == RunnerStatus::Stopping {
            return Err(ErrorInfo::validation(format!(
                "cannot register agent '{}' while runner is {}",
                name,
                status.as_str()
            )));
        }

        let wrapped = Arc::new(MemoryAwareHandler::new(
            name,
            handler,
            self.callbacks.clone(),
            self.memory.clone(),
        ));
        self.orchestrator
            .register_agent(name, wrapped)
            .map_err(|e| ErrorInfo::validation(e.to_string()))
    }

    /// Register a callback at a hook point.
    pub fn register_callback(
        &self,
        hook: HookPoint,
        name: impl Into<String>,
        callback: Arc<dyn Callback>,
    ) {
        self.callbacks.register(hook, name, callback);
    }

    /// Remove a named callback from a hook point.
    pub fn unregister_callback(&self, hook: HookPoint, name: &str) -> bool {
        self.callbacks.unregister(hook, name)
    }

    /// The shared callback registry.
    pub fn callback_registry(&self) -> Arc<CallbackRegistry> {
        self.callbacks.clone()
    }

    /// The shared trace logger.
    pub fn trace_logger(&self) -> Arc<dyn TraceLogger> {
        self.trace.clone()
    }

    /// The session assigned to events emitted without one.
    pub fn default_session(&self) -> &str {
        &self.default_session
    }

    /// Transition `Idle → Running`: validate the orchestrator against the
    /// registered agents, create the queue, and spawn the worker pool.
    ///
    /// Must be called inside a tokio runtime. A second start while running
    /// is rejected with a `Validation` error.
    pub fn start(&self) -> Result<(), ErrorInfo> {
        let mut status = self
            .status
            .lock()
            .map_err(|_| ErrorInfo::internal("runner status lock poisoned"))?;
        match *status {
            RunnerStatus::Idle | RunnerStatus::Stopped => {}
            other => {
                return Err(ErrorInfo::validation(format!(
                    "cannot start: runner is {}",
                    other.as_str()
                )))
            }
        }

        // Misconfigurations (unknown plan agents, missing loop agent)
        // surface here, before any dispatch.
        self.orchestrator
            .validate()
            .map_err(|e| ErrorInfo::validation(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Event>(self.config.queue_size);
        let cancel = CancellationToken::new();

        let shared = Arc::new(WorkerShared {
            orchestrator: self.orchestrator.clone(),
            callbacks: self.callbacks.clone(),
            trace: self.trace.clone(),
            memory: self.memory.clone(),
            router: self.router.clone(),
            emitter: tx.downgrade(),
            cancel: cancel.clone(),
            default_session: self.default_session.clone(),
            dispatch_timeout: self.config.orchestration.timeout,
            retry: self.config.retry.clone(),
        });

        let rx = Arc::new(AsyncMutex::new(rx));
        if let Ok(mut slot) = self.receiver.try_lock() {
            *slot = Some(rx.clone());
        }

        let mut workers = self
            .workers
            .lock()
            .map_err(|_| ErrorInfo::internal("runner worker lock poisoned"))?;
        workers.clear();
        for _ in 0..self.config.max_concurrent_agents {
            workers.push(tokio::spawn(worker_loop(shared.clone(), rx.clone())));
        }

        if let Ok(mut slot) = self.sender.lock() {
            *slot = Some(tx);
        }
        if let Ok(mut slot) = self.cancel.lock() {
            *slot = cancel;
        }
        *status = RunnerStatus::Running;

        log::info!(
            "runner started: {} workers, queue capacity {}, mode {}",
            self.config.max_concurrent_agents,
            self.config.queue_size,
            self.config.orchestration.mode
        );
        Ok(())
    }

    /// Enqueue an event, blocking while the queue is full.
    ///
    /// Rejected with a `Validation` error unless the runner is running.
    /// Events without a session are stamped with the runner's default
    /// session before enqueueing; after that the event is immutable.
    pub async fn emit(&self, event: Event) -> Result<(), ErrorInfo> {
        let status = self.current_status();
        if status != RunnerStatus::Running {
            return Err(ErrorInfo::validation(format!(
                "cannot emit while runner is {}",
                status.as_str()
            )));
        }

        let Some(sender) = self.sender.lock().ok().and_then(|s| s.clone()) else {
            return Err(ErrorInfo::validation("runner queue is closed"));
        };
        let cancel = self
            .cancel
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default();

        let event = if event.session_id().is_none() {
            event.with_session(self.default_session.clone())
        } else {
            event
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ErrorInfo::timeout(
                "emit cancelled while waiting for queue capacity",
            )),
            sent = sender.send(event) => {
                sent.map_err(|_| ErrorInfo::validation("runner queue is closed"))
            }
        }
    }

    /// Transition to `Stopping`, close the queue, wait for workers to
    /// drain, then transition to `Stopped`. Idempotent.
    ///
    /// In-flight handlers observe cancellation through their context; a
    /// worker that has not finished within the grace period is aborted and
    /// its result discarded. The shared memory handle is closed last.
    pub async fn stop(&self) -> Result<(), ErrorInfo> {
        {
            let mut status = self
                .status
                .lock()
                .map_err(|_| ErrorInfo::internal("runner status lock poisoned"))?;
            match *status {
                RunnerStatus::Running => *status = RunnerStatus::Stopping,
                RunnerStatus::Idle => {
                    *status = RunnerStatus::Stopped;
                    return Ok(());
                }
                RunnerStatus::Stopping | RunnerStatus::Stopped => return Ok(()),
            }
        }

        // Closing the last strong sender wakes workers blocked on recv.
        if let Ok(mut slot) = self.sender.lock() {
            slot.take();
        }
        if let Ok(cancel) = self.cancel.lock().map(|c| c.clone()) {
            cancel.cancel();
        }
        self.orchestrator.stop();

        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .map(|mut w| w.drain(..).collect())
            .unwrap_or_default();

        let deadline = tokio::time::Instant::now() + self.config.grace_period;
        for handle in handles {
            let abort = handle.abort_handle();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                log::warn!("worker exceeded the shutdown grace period; discarding its result");
                abort.abort();
            }
        }

        {
            let mut slot = self.receiver.lock().await;
            slot.take();
        }

        if let Some(memory) = &self.memory {
            if let Err(e) = memory.close().await {
                log::warn!("memory close failed during shutdown: {}", e);
            }
        }

        if let Ok(mut status) = self.status.lock() {
            *status = RunnerStatus::Stopped;
        }
        log::info!("runner stopped");
        Ok(())
    }

    /// Chronological trace of a session: every hook firing, retry, and
    /// error-route decision.
    ///
    /// When `trace_dir` is configured, also writes the session's
    /// `<session_id>.trace.json` file atomically. Calling twice with no
    /// intervening activity returns equal sequences.
    pub fn dump_trace(&self, session_id: &str) -> Result<Vec<TraceEntry>, ErrorInfo> {
        let entries = self.trace.get_trace(session_id);
        if let Some(dir) = &self.config.trace_dir {
            std::fs::create_dir_all(dir).map_err(|e| {
                ErrorInfo::internal(format!("cannot create trace directory: {}", e))
            })?;
            let path = dir.join(trace_file_name(session_id));
            write_trace_file(&path, &entries)
                .map_err(|e| ErrorInfo::internal(format!("cannot write trace file: {}", e)))?;
        }
        Ok(entries)
    }

    fn current_status(&self) -> RunnerStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(RunnerStatus::Stopped)
    }
}

/// Build the orchestrator selected by the configuration.
fn build_orchestrator(config: &RunnerConfig) -> Arc<dyn Orchestrator> {
    let o = &config.orchestration;
    match o.mode {
        OrchestrationMode::Route => Arc::new(RouteOrchestrator::new()),
        OrchestrationMode::Collaborative => Arc::new(
            CollaborativeOrchestrator::new()
                .with_participants(o.collaborative_agents.clone())
                .with_concurrency_limit(o.concurrency_limit)
                .with_handler_timeout(o.timeout)
                .with_failure_threshold(o.failure_threshold),
        ),
        OrchestrationMode::Sequential => Arc::new(
            SequentialOrchestrator::new()
                .with_sequence(o.sequential_agents.clone())
                .with_retry_policy(config.retry.clone()),
        ),
        OrchestrationMode::Loop => {
            let mut orchestrator = LoopOrchestrator::new()
                .with_max_iterations(o.max_iterations)
                .with_retry_policy(config.retry.clone());
            if let Some(name) = &o.loop_agent {
                orchestrator = orchestrator.with_loop_agent(name.clone());
            }
            Arc::new(orchestrator)
        }
        OrchestrationMode::Mixed => {
            let mut orchestrator = MixedOrchestrator::new()
                .with_concurrency_limit(o.concurrency_limit)
                .with_handler_timeout(o.timeout)
                .with_failure_threshold(o.failure_threshold)
                .with_retry_policy(config.retry.clone());
            if let Some(plan) = &o.mixed_plan {
                orchestrator = orchestrator.with_plan(plan.clone());
            }
            Arc::new(orchestrator)
        }
    }
}

/// One worker: dequeue, process, repeat until the queue closes.
async fn worker_loop(shared: Arc<WorkerShared>, rx: Arc<AsyncMutex<mpsc::Receiver<Event>>>) {
    loop {
        let next = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(event) = next else { break };

        if shared.cancel.is_cancelled() {
            // Drained after stop: record the cancellation, skip dispatch.
            let session = event
                .session_id()
                .unwrap_or(&shared.default_session)
                .to_string();
            shared.trace.log(
                TraceEntry::new(session, event.id(), TRACE_HOOK_DISPATCH)
                    .with_error("dispatch cancelled: runner stopping")
                    .with_result(DispatchStatus::Cancelled.as_str()),
            );
            continue;
        }

        process_event(&shared, event).await;
    }
}

/// The per-event pipeline: hooks, dispatch with timeout and retry, error
/// routing.
async fn process_event(shared: &Arc<WorkerShared>, event: Event) {
    let session = event
        .session_id()
        .unwrap_or(&shared.default_session)
        .to_string();

    let mut ctx = AgentContext::new()
        .with_session(session.clone())
        .with_cancellation(shared.cancel.child_token());
    if let Some(memory) = &shared.memory {
        ctx = ctx.with_memory(memory.clone());
    }

    let seed = seed_state(&event);
    shared
        .callbacks
        .invoke(
            HookPoint::BeforeEventHandling,
            CallbackArgs::new(HookPoint::BeforeEventHandling, event.clone(), seed.clone()),
        )
        .await;

    let result = dispatch_with_retry(shared, &ctx, &event, &session).await;

    let status = DispatchStatus::of(&result);
    let mut entry = TraceEntry::new(session.clone(), event.id(), TRACE_HOOK_DISPATCH)
        .with_result(status.as_str());
    if let Some(info) = &result.error_info {
        entry = entry.with_error(info.to_string());
    }
    shared.trace.log(entry);

    let mut after = CallbackArgs::new(HookPoint::AfterEventHandling, event.clone(), seed)
        .with_output(result.output_state.clone());
    if let Some(info) = &result.error_info {
        after = after.with_error(info.clone());
    }
    shared
        .callbacks
        .invoke(HookPoint::AfterEventHandling, after)
        .await;

    if let Some(info) = &result.error_info {
        route_failure(shared, &session, &event, info).await;
    }
}

/// Dispatch one event, retrying retryable failures under the runner-level
/// policy. Retries share the event id; each attempt leaves its own trace.
async fn dispatch_with_retry(
    shared: &Arc<WorkerShared>,
    ctx: &AgentContext,
    event: &Event,
    session: &str,
) -> AgentResult {
    let mut attempt: u32 = 0;
    loop {
        let result = dispatch_once(shared, ctx, event).await;
        match &result.error_info {
            Some(info)
                if info.retryable
                    && attempt < shared.retry.max_retries
                    && !event.is_error_event()
                    && !shared.cancel.is_cancelled() =>
            {
                let delay = shared.retry.delay(attempt);
                attempt += 1;
                shared.trace.log(
                    TraceEntry::new(session, event.id(), TRACE_HOOK_RETRY)
                        .with_error(info.to_string())
                        .with_result(format!(
                            "attempt {}/{} in {:?}",
                            attempt, shared.retry.max_retries, delay
                        )),
                );
                log::warn!(
                    "dispatch of '{}' failed ({}), retry {}/{} in {:?}",
                    event.id(),
                    info,
                    attempt,
                    shared.retry.max_retries,
                    delay
                );
                tokio::select! {
                    _ = shared.cancel.cancelled() => {
                        return AgentResult::failure(ErrorInfo::cancelled(
                            "dispatch cancelled while waiting to retry",
                        ));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            _ => return result,
        }
    }
}

/// One dispatch attempt.
///
/// Error events bypass the configured discipline: they are delivered
/// straight to the recovery agent named in their `route` metadata,
/// whatever orchestrator is active.
async fn dispatch_once(
    shared: &Arc<WorkerShared>,
    ctx: &AgentContext,
    event: &Event,
) -> AgentResult {
    if event.is_error_event() {
        let route = event
            .metadata()
            .get(ROUTE_METADATA_KEY)
            .cloned()
            .unwrap_or_default();
        let Some(handler) = shared.orchestrator.agent(&route) else {
            return AgentResult::failure(ErrorInfo::validation(format!(
                "error event targets unregistered agent '{}'",
                route
            )));
        };
        let seed = seed_state(event);
        return run_handler(&route, &handler, ctx, event, seed).await;
    }

    match tokio::time::timeout(
        shared.dispatch_timeout,
        shared.orchestrator.dispatch(ctx, event),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => AgentResult::failure(ErrorInfo::timeout(format!(
            "dispatch timed out after {:?}",
            shared.dispatch_timeout
        ))),
    }
}

/// Hand a failed dispatch to the error router and act on its decision.
async fn route_failure(
    shared: &Arc<WorkerShared>,
    session: &str,
    event: &Event,
    info: &ErrorInfo,
) {
    let registered = shared.orchestrator.agent_names();
    match shared.router.route(session, event, info, &registered) {
        RouteDecision::Disabled => {}
        RouteDecision::Recursive => {
            shared.trace.log(
                TraceEntry::new(session, event.id(), TRACE_HOOK_ERROR_ROUTER)
                    .with_error(format!("failure while handling error event dropped: {}", info)),
            );
            log::warn!("error handler itself failed for '{}'; dropping", event.id());
        }
        RouteDecision::NoHandler => {
            shared.trace.log(
                TraceEntry::new(session, event.id(), TRACE_HOOK_ERROR_ROUTER)
                    .with_error(format!("no registered recovery agent for {}", info)),
            );
        }
        RouteDecision::CircuitOpen => {
            shared.trace.log(
                TraceEntry::new(session, event.id(), TRACE_HOOK_CIRCUIT_BREAKER).with_error(
                    format!(
                        "circuit breaker open for category '{}': follow-up dropped (critical)",
                        info.category
                    ),
                ),
            );
            log::error!(
                "circuit breaker open for session '{}' category '{}'",
                session,
                info.category
            );
        }
        RouteDecision::Routed {
            handler,
            event: follow_up,
        } => {
            let Some(sender) = shared.emitter.upgrade() else {
                return;
            };
            match sender.try_send(follow_up) {
                Ok(()) => {
                    shared.trace.log(
                        TraceEntry::new(session, event.id(), TRACE_HOOK_ERROR_ROUTER)
                            .with_result(format!("routed to '{}'", handler)),
                    );
                }
                Err(_) => {
                    shared.trace.log(
                        TraceEntry::new(session, event.id(), TRACE_HOOK_ERROR_ROUTER)
                            .with_error("queue full: error follow-up dropped"),
                    );
                    log::warn!(
                        "queue full: dropping error follow-up for '{}'",
                        event.id()
                    );
                }
            }
        }
    }
}
