// src/lib.rs

// Import the top-level `agentmesh` module.
pub mod agentmesh;

// Re-exporting key items for easier external access.
pub use agentmesh::agent::{AgentHandler, AgentResult, HandlerError, MemoryAwareHandler};
pub use agentmesh::callbacks::{
    Callback, CallbackArgs, CallbackFuture, CallbackRegistry, FnCallback, HookPoint, InvokeOutcome,
};
pub use agentmesh::config::{
    CircuitBreakerConfig, ConfigError, ErrorRoutingConfig, OrchestrationConfig, OrchestrationMode,
    RunnerConfig,
};
pub use agentmesh::context::AgentContext;
pub use agentmesh::error_router::{ErrorRouter, RouteDecision};
pub use agentmesh::errors::{ErrorCategory, ErrorInfo, ErrorSeverity};
pub use agentmesh::event::{Event, CAUSED_BY_METADATA_KEY, ERROR_EVENT_TYPE};
pub use agentmesh::memory::{InMemoryMemory, Memory, MemoryError, MemoryMessage, MemoryResult};
pub use agentmesh::orchestrator::{
    CollaborativeOrchestrator, DispatchStatus, LoopOrchestrator, LoopPredicate, MixedOrchestrator,
    MixedPlan, Orchestrator, OrchestratorError, PlanSegment, RouteOrchestrator,
    SequentialOrchestrator, ITERATIONS_METADATA_KEY,
};
pub use agentmesh::retry::{Backoff, RetryPolicy};
pub use agentmesh::runner::Runner;
pub use agentmesh::state::{State, ROUTE_METADATA_KEY, SESSION_ID_METADATA_KEY};
pub use agentmesh::trace::{
    trace_file_name, FileTraceLogger, InMemoryTraceLogger, TraceEntry, TraceLogger,
    RESULT_SUMMARY_LIMIT,
};
