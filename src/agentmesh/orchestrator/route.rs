//! Route discipline: metadata-selected single-agent dispatch.

use crate::agentmesh::agent::{AgentHandler, AgentResult};
use crate::agentmesh::context::AgentContext;
use crate::agentmesh::errors::ErrorInfo;
use crate::agentmesh::event::Event;
use crate::agentmesh::orchestrator::{run_handler, seed_state, AgentTable, Orchestrator, OrchestratorError};
use crate::agentmesh::state::ROUTE_METADATA_KEY;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Dispatches each event to exactly one agent, named by the event's
/// `route` metadata.
///
/// The handler runs synchronously on a fresh state seeded from the event
/// payload, and its result is returned verbatim. A missing or unknown
/// route is a `Validation`/`High` failure.
///
/// # Example
///
/// ```rust
/// use agentmesh::{
///     AgentContext, AgentHandler, AgentResult, Event, HandlerError,
///     Orchestrator, RouteOrchestrator, State,
/// };
/// use async_trait::async_trait;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// struct Upper;
///
/// #[async_trait]
/// impl AgentHandler for Upper {
///     async fn run(
///         &self,
///         _ctx: &AgentContext,
///         _event: &Event,
///         state: State,
///     ) -> Result<AgentResult, HandlerError> {
///         let mut out = state;
///         let text = out.get("text").and_then(|v| v.as_str()).unwrap_or("").to_uppercase();
///         out.set("text", json!(text));
///         Ok(AgentResult::success(out))
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let orchestrator = RouteOrchestrator::new();
/// orchestrator.register_agent("upper", Arc::new(Upper)).unwrap();
///
/// let event = Event::new("task", json!({"text": "hi"})).with_metadata("route", "upper");
/// let result = orchestrator.dispatch(&AgentContext::new(), &event).await;
/// assert_eq!(result.output_state.get("text"), Some(&json!("HI")));
/// # }
/// ```
pub struct RouteOrchestrator {
    agents: AgentTable,
    cancel: CancellationToken,
}

impl RouteOrchestrator {
    /// Create an empty route orchestrator.
    pub fn new() -> Self {
        Self {
            agents: AgentTable::new(),
            cancel: CancellationToken::new(),
        }
    }
}

impl Default for RouteOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Orchestrator for RouteOrchestrator {
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

    async fn dispatch(&self, ctx: &AgentContext, event: &Event) -> AgentResult {
        let route = event
            .metadata()
            .get(ROUTE_METADATA_KEY)
            .map(String::as_str)
            .unwrap_or("");
        if route.is_empty() {
            return AgentResult::failure(ErrorInfo::validation(format!(
                "event '{}' carries no '{}' metadata",
                event.id(),
                ROUTE_METADATA_KEY
            )));
        }

        let Some(handler) = self.agents.get(route) else {
            return AgentResult::failure(ErrorInfo::validation(format!(
                "no agent registered under route '{}'",
                route
            )));
        };

        let seed = seed_state(event);
        tokio::select! {
            _ = ctx.cancellation().cancelled() => {
                AgentResult::failure(ErrorInfo::cancelled("dispatch cancelled"))
            }
            _ = self.cancel.cancelled() => {
                AgentResult::failure(ErrorInfo::cancelled("dispatch cancelled"))
            }
            result = run_handler(route, &handler, ctx, event, seed) => result,
        }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}
