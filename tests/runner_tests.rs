use agentmesh::{
    AgentContext, AgentHandler, AgentResult, Backoff, CallbackArgs, CircuitBreakerConfig,
    ErrorCategory, ErrorInfo, Event, FnCallback, HandlerError, HookPoint, InMemoryMemory, Memory,
    OrchestrationMode, RetryPolicy, Runner, RunnerConfig, State,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

struct EchoHandler;

#[async_trait]
impl AgentHandler for EchoHandler {
    async fn run(
        &self,
        _ctx: &AgentContext,
        _event: &Event,
        state: State,
    ) -> Result<AgentResult, HandlerError> {
        let mut out = state;
        let msg = out.get("msg").cloned().unwrap_or(json!(""));
        out.set("out", msg);
        Ok(AgentResult::success(out))
    }
}

struct CountingHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl AgentHandler for CountingHandler {
    async fn run(
        &self,
        _ctx: &AgentContext,
        _event: &Event,
        state: State,
    ) -> Result<AgentResult, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut out = state;
        out.set("handled", json!(call + 1));
        Ok(AgentResult::success(out))
    }
}

struct FailingHandler {
    error: ErrorInfo,
}

#[async_trait]
impl AgentHandler for FailingHandler {
    async fn run(
        &self,
        _ctx: &AgentContext,
        _event: &Event,
        _state: State,
    ) -> Result<AgentResult, HandlerError> {
        Err(Box::new(self.error.clone()))
    }
}

struct SleepingHandler {
    delay: Duration,
    completed: Arc<AtomicUsize>,
}

#[async_trait]
impl AgentHandler for SleepingHandler {
    async fn run(
        &self,
        _ctx: &AgentContext,
        _event: &Event,
        state: State,
    ) -> Result<AgentResult, HandlerError> {
        tokio::time::sleep(self.delay).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        let mut out = state;
        out.set("slept", json!(true));
        Ok(AgentResult::success(out))
    }
}

/// Stores one line in memory under the dispatch session.
struct MemoHandler;

#[async_trait]
impl AgentHandler for MemoHandler {
    async fn run(
        &self,
        ctx: &AgentContext,
        _event: &Event,
        state: State,
    ) -> Result<AgentResult, HandlerError> {
        let memory = ctx.memory().ok_or_else(|| {
            Box::new(ErrorInfo::internal("context carries no memory handle")) as HandlerError
        })?;
        memory
            .store(ctx, "remembered from inside the handler", &[])
            .await
            .map_err(|e| Box::new(e) as HandlerError)?;

        let mut out = state;
        out.set("session_seen", json!(ctx.session_id()));
        Ok(AgentResult::success(out))
    }
}

/// Register a callback that forwards every AfterEventHandling firing to a
/// channel, so tests can await completions deterministically.
fn watch_completions(runner: &Runner) -> mpsc::UnboundedReceiver<CallbackArgs> {
    let (tx, rx) = mpsc::unbounded_channel();
    runner.register_callback(
        HookPoint::AfterEventHandling,
        "test-watcher",
        Arc::new(FnCallback::new(move |args| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(args);
                Ok(None)
            })
        })),
    );
    rx
}

async fn recv_completion(rx: &mut mpsc::UnboundedReceiver<CallbackArgs>) -> CallbackArgs {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for an event to finish")
        .expect("completion channel closed")
}

fn route_config() -> RunnerConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = RunnerConfig::default();
    config.retry = RetryPolicy::none();
    config
}

#[tokio::test]
async fn route_happy_path_produces_ordered_trace() {
    let runner = Runner::new(route_config()).unwrap();
    runner.register_agent("echo", Arc::new(EchoHandler)).unwrap();
    let mut completions = watch_completions(&runner);
    runner.start().unwrap();

    runner
        .emit(
            Event::new("user_message", json!({"msg": "hi"}))
                .with_metadata("route", "echo")
                .with_session("S1"),
        )
        .await
        .unwrap();

    let done = recv_completion(&mut completions).await;
    assert_eq!(
        done.output.as_ref().and_then(|s| s.get("out")),
        Some(&json!("hi"))
    );
    assert!(done.error.is_none());

    runner.stop().await.unwrap();

    let trace = runner.dump_trace("S1").unwrap();
    let hooks: Vec<&str> = trace
        .iter()
        .filter(|e| {
            matches!(
                e.hook.as_str(),
                "before_event_handling" | "before_agent_run" | "after_agent_run"
                    | "after_event_handling"
            )
        })
        .map(|e| e.hook.as_str())
        .collect();
    assert_eq!(
        hooks,
        vec![
            "before_event_handling",
            "before_agent_run",
            "after_agent_run",
            "after_event_handling",
        ]
    );

    let agent_entries: Vec<_> = trace
        .iter()
        .filter(|e| e.agent_name.as_deref() == Some("echo"))
        .collect();
    assert_eq!(agent_entries.len(), 2);
}

#[tokio::test]
async fn emit_is_rejected_unless_running() {
    let runner = Runner::new(route_config()).unwrap();
    runner.register_agent("echo", Arc::new(EchoHandler)).unwrap();

    let err = runner
        .emit(Event::new("t", json!({})).with_metadata("route", "echo"))
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Validation);

    runner.start().unwrap();
    runner.stop().await.unwrap();

    let err = runner
        .emit(Event::new("t", json!({})).with_metadata("route", "echo"))
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Validation);
}

#[tokio::test]
async fn double_start_is_rejected_and_stop_is_idempotent() {
    let runner = Runner::new(route_config()).unwrap();
    runner.register_agent("echo", Arc::new(EchoHandler)).unwrap();

    runner.start().unwrap();
    let err = runner.start().unwrap_err();
    assert_eq!(err.category, ErrorCategory::Validation);

    runner.stop().await.unwrap();
    runner.stop().await.unwrap();
}

#[tokio::test]
async fn registration_is_rejected_while_running() {
    let runner = Runner::new(route_config()).unwrap();
    runner.register_agent("echo", Arc::new(EchoHandler)).unwrap();
    runner.start().unwrap();

    let err = runner
        .register_agent("late", Arc::new(EchoHandler))
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Validation);

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn handlers_observe_memory_and_session() {
    let memory = Arc::new(InMemoryMemory::new());
    let runner = Runner::new(route_config())
        .unwrap()
        .with_memory(memory.clone());
    runner.register_agent("memo", Arc::new(MemoHandler)).unwrap();
    let mut completions = watch_completions(&runner);
    runner.start().unwrap();

    runner
        .emit(
            Event::new("note", json!({}))
                .with_metadata("route", "memo")
                .with_session("mem-session"),
        )
        .await
        .unwrap();

    let done = recv_completion(&mut completions).await;
    assert!(done.error.is_none(), "handler failed: {:?}", done.error);
    assert_eq!(
        done.output.as_ref().and_then(|s| s.get("session_seen")),
        Some(&json!("mem-session"))
    );
    assert_eq!(memory.session_len("mem-session"), 1);

    runner.stop().await.unwrap();

    // Stop closes the shared handle.
    let ctx = AgentContext::new().with_session("mem-session");
    assert!(memory.store(&ctx, "too late", &[]).await.is_err());
}

#[tokio::test]
async fn events_without_session_get_the_default_session() {
    let mut config = route_config();
    config.session_id = Some("fixed-session".to_string());
    let runner = Runner::new(config).unwrap();
    runner.register_agent("echo", Arc::new(EchoHandler)).unwrap();
    let mut completions = watch_completions(&runner);
    runner.start().unwrap();

    runner
        .emit(Event::new("t", json!({"msg": "x"})).with_metadata("route", "echo"))
        .await
        .unwrap();
    let done = recv_completion(&mut completions).await;
    assert_eq!(done.event.session_id(), Some("fixed-session"));

    runner.stop().await.unwrap();
    assert!(!runner.dump_trace("fixed-session").unwrap().is_empty());
}

#[tokio::test]
async fn runner_retries_retryable_dispatch_failures() {
    struct FlakyOnce {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AgentHandler for FlakyOnce {
        async fn run(
            &self,
            _ctx: &AgentContext,
            _event: &Event,
            state: State,
        ) -> Result<AgentResult, HandlerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Box::new(ErrorInfo::network("connection refused")));
            }
            let mut out = state;
            out.set("attempt", json!("second"));
            Ok(AgentResult::success(out))
        }
    }

    let mut config = RunnerConfig::default();
    config.retry = RetryPolicy::new(2, Backoff::Fixed(Duration::from_millis(5)));
    let runner = Runner::new(config).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    runner
        .register_agent("flaky", Arc::new(FlakyOnce { calls: calls.clone() }))
        .unwrap();
    let mut completions = watch_completions(&runner);
    runner.start().unwrap();

    runner
        .emit(
            Event::new("t", json!({}))
                .with_metadata("route", "flaky")
                .with_session("retry-session"),
        )
        .await
        .unwrap();

    let done = recv_completion(&mut completions).await;
    assert!(done.error.is_none(), "second attempt should succeed");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    runner.stop().await.unwrap();

    let trace = runner.dump_trace("retry-session").unwrap();
    let retries = trace.iter().filter(|e| e.hook == "retry").count();
    assert_eq!(retries, 1, "one retry entry for the failed first attempt");
}

#[tokio::test]
async fn error_routing_respects_the_circuit_breaker() {
    let mut config = route_config();
    config.error_routing.enabled = true;
    config.error_routing.circuit_breaker = CircuitBreakerConfig {
        threshold: 2,
        window: Duration::from_secs(60),
    };
    let runner = Runner::new(config).unwrap();

    let recovered = Arc::new(AtomicUsize::new(0));
    runner
        .register_agent(
            "boom",
            Arc::new(FailingHandler {
                error: ErrorInfo::new(
                    ErrorCategory::Llm,
                    agentmesh::ErrorSeverity::High,
                    "provider exploded",
                ),
            }),
        )
        .unwrap();
    runner
        .register_agent(
            "error-handler",
            Arc::new(CountingHandler { calls: recovered.clone() }),
        )
        .unwrap();

    let mut completions = watch_completions(&runner);
    runner.start().unwrap();

    for _ in 0..5 {
        runner
            .emit(
                Event::new("work", json!({}))
                    .with_metadata("route", "boom")
                    .with_session("CB"),
            )
            .await
            .unwrap();
    }

    // 5 original failures + 2 routed error events finish handling.
    for _ in 0..7 {
        recv_completion(&mut completions).await;
    }

    runner.stop().await.unwrap();

    assert_eq!(
        recovered.load(Ordering::SeqCst),
        2,
        "only two follow-ups may pass the breaker"
    );

    let trace = runner.dump_trace("CB").unwrap();
    let routed = trace.iter().filter(|e| e.hook == "error_router").count();
    let tripped = trace.iter().filter(|e| e.hook == "circuit_breaker").count();
    assert_eq!(routed, 2);
    assert_eq!(tripped, 3);
}

#[tokio::test]
async fn failures_while_handling_error_events_are_dropped() {
    let mut config = route_config();
    config.error_routing.enabled = true;
    let runner = Runner::new(config).unwrap();

    runner
        .register_agent(
            "boom",
            Arc::new(FailingHandler { error: ErrorInfo::internal("primary down") }),
        )
        .unwrap();
    // The recovery agent itself fails; no secondary follow-up may appear.
    runner
        .register_agent(
            "error-handler",
            Arc::new(FailingHandler { error: ErrorInfo::internal("recovery down") }),
        )
        .unwrap();

    let mut completions = watch_completions(&runner);
    runner.start().unwrap();

    runner
        .emit(
            Event::new("work", json!({}))
                .with_metadata("route", "boom")
                .with_session("R"),
        )
        .await
        .unwrap();

    // Original event + one routed error event, and nothing after that.
    recv_completion(&mut completions).await;
    recv_completion(&mut completions).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(completions.try_recv().is_err(), "router must not recurse");

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn graceful_shutdown_cancels_queued_and_in_flight_events() {
    let mut config = route_config();
    config.max_concurrent_agents = 2;
    config.grace_period = Duration::from_secs(5);
    let runner = Runner::new(config).unwrap();
    let completed = Arc::new(AtomicUsize::new(0));
    runner
        .register_agent(
            "slow",
            Arc::new(SleepingHandler {
                delay: Duration::from_secs(2),
                completed: completed.clone(),
            }),
        )
        .unwrap();
    runner.start().unwrap();

    for _ in 0..5 {
        runner
            .emit(
                Event::new("work", json!({}))
                    .with_metadata("route", "slow")
                    .with_session("G"),
            )
            .await
            .unwrap();
    }

    let began = Instant::now();
    runner.stop().await.unwrap();
    let elapsed = began.elapsed();
    assert!(
        elapsed < Duration::from_secs(5),
        "stop must return within the grace period, took {:?}",
        elapsed
    );

    let trace = runner.dump_trace("G").unwrap();
    let cancelled = trace
        .iter()
        .filter(|e| e.result.as_deref() == Some("Cancelled"))
        .count();
    assert!(cancelled > 0, "cancelled events must be recorded in the trace");
    assert_eq!(completed.load(Ordering::SeqCst), 0, "no handler ran to completion");
}

#[tokio::test]
async fn emit_blocks_on_a_full_queue_until_capacity_frees() {
    let mut config = route_config();
    config.queue_size = 1;
    config.max_concurrent_agents = 1;
    let runner = Runner::new(config).unwrap();
    let completed = Arc::new(AtomicUsize::new(0));
    runner
        .register_agent(
            "slow",
            Arc::new(SleepingHandler {
                delay: Duration::from_millis(50),
                completed: completed.clone(),
            }),
        )
        .unwrap();
    let mut completions = watch_completions(&runner);
    runner.start().unwrap();

    for _ in 0..4 {
        runner
            .emit(
                Event::new("work", json!({}))
                    .with_metadata("route", "slow")
                    .with_session("BP"),
            )
            .await
            .unwrap();
    }

    for _ in 0..4 {
        recv_completion(&mut completions).await;
    }
    assert_eq!(completed.load(Ordering::SeqCst), 4);

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn dump_trace_is_idempotent() {
    let runner = Runner::new(route_config()).unwrap();
    runner.register_agent("echo", Arc::new(EchoHandler)).unwrap();
    let mut completions = watch_completions(&runner);
    runner.start().unwrap();

    runner
        .emit(
            Event::new("t", json!({"msg": "x"}))
                .with_metadata("route", "echo")
                .with_session("D"),
        )
        .await
        .unwrap();
    recv_completion(&mut completions).await;
    runner.stop().await.unwrap();

    let first = runner.dump_trace("D").unwrap();
    let second = runner.dump_trace("D").unwrap();
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

#[tokio::test]
async fn collaborative_mode_merges_and_traces_every_agent() {
    struct Namespaced {
        name: &'static str,
    }

    #[async_trait]
    impl AgentHandler for Namespaced {
        async fn run(
            &self,
            _ctx: &AgentContext,
            _event: &Event,
            state: State,
        ) -> Result<AgentResult, HandlerError> {
            let mut out = state;
            out.set(format!("agent:{}:out", self.name), json!(self.name));
            Ok(AgentResult::success(out))
        }
    }

    let mut config = RunnerConfig::default();
    config.orchestration.mode = OrchestrationMode::Collaborative;
    config.orchestration.failure_threshold = 0.5;
    config.retry = RetryPolicy::none();

    let runner = Runner::new(config).unwrap();
    runner.register_agent("a", Arc::new(Namespaced { name: "a" })).unwrap();
    runner
        .register_agent(
            "b",
            Arc::new(FailingHandler { error: ErrorInfo::network("connection refused") }),
        )
        .unwrap();
    runner.register_agent("c", Arc::new(Namespaced { name: "c" })).unwrap();

    let mut completions = watch_completions(&runner);
    runner.start().unwrap();
    runner
        .emit(Event::new("fanout", json!({"seed": true})).with_session("COL"))
        .await
        .unwrap();

    let done = recv_completion(&mut completions).await;
    assert!(done.error.is_none(), "one failure of three is partial success");
    let output = done.output.expect("merged output state");
    assert_eq!(output.get("agent:a:out"), Some(&json!("a")));
    assert_eq!(output.get("agent:c:out"), Some(&json!("c")));
    assert_eq!(output.get("errors:b").map(|v| &v["category"]), Some(&json!("network")));

    runner.stop().await.unwrap();

    let trace = runner.dump_trace("COL").unwrap();
    let before = trace.iter().filter(|e| e.hook == "before_agent_run").count();
    let after = trace.iter().filter(|e| e.hook == "after_agent_run").count();
    assert_eq!(before, 3);
    assert_eq!(after, 3);
}

#[tokio::test]
async fn sequential_mode_is_built_from_config() {
    let mut config = RunnerConfig::default();
    config.orchestration.mode = OrchestrationMode::Sequential;
    config.orchestration.sequential_agents = vec!["p".to_string(), "q".to_string()];
    config.retry = RetryPolicy::none();

    let runner = Runner::new(config).unwrap();
    let p_calls = Arc::new(AtomicUsize::new(0));
    let q_calls = Arc::new(AtomicUsize::new(0));
    runner
        .register_agent("p", Arc::new(CountingHandler { calls: p_calls.clone() }))
        .unwrap();
    runner
        .register_agent("q", Arc::new(CountingHandler { calls: q_calls.clone() }))
        .unwrap();
    let mut completions = watch_completions(&runner);
    runner.start().unwrap();

    runner
        .emit(Event::new("t", json!({})).with_session("SEQ"))
        .await
        .unwrap();
    let done = recv_completion(&mut completions).await;
    assert!(done.error.is_none());
    assert_eq!(p_calls.load(Ordering::SeqCst), 1);
    assert_eq!(q_calls.load(Ordering::SeqCst), 1);

    runner.stop().await.unwrap();

    // Two agents, each with its paired before/after hooks.
    let trace = runner.dump_trace("SEQ").unwrap();
    let before_runs = trace.iter().filter(|e| e.hook == "before_agent_run").count();
    assert_eq!(before_runs, 2);
}

#[tokio::test]
async fn startup_fails_on_invalid_mixed_plan() {
    use agentmesh::{MixedPlan, PlanSegment};

    let mut config = RunnerConfig::default();
    config.orchestration.mode = OrchestrationMode::Mixed;
    config.orchestration.mixed_plan = Some(MixedPlan::new(vec![PlanSegment::Sequential(vec![
        "ghost".to_string(),
    ])]));

    let runner = Runner::new(config).unwrap();
    runner.register_agent("real", Arc::new(EchoHandler)).unwrap();

    let err = runner.start().unwrap_err();
    assert_eq!(err.category, ErrorCategory::Validation);
}
