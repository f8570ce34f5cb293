//! Error routing with circuit-breaker protection.
//!
//! When a dispatch fails and routing is enabled, the [`ErrorRouter`] turns
//! the classified failure into a follow-up event aimed at a specialized
//! recovery agent:
//!
//! ```text
//! failed dispatch
//!   └─ classify ──► select handler ──► circuit breaker ──► emit `error` event
//!        │             (precedence)        (per session ×        (route metadata =
//!        │                                  category window)      selected handler)
//!        └─ failures while handling an `error` event are logged and
//!           dropped — the router never recurses
//! ```
//!
//! Handler selection precedence: exact `(category, severity)` mapping →
//! category-only → severity-only → the default handler. A mapping whose
//! target agent is not registered falls through to the next level.
//!
//! The circuit breaker counts routed failures per `(session, category)`
//! inside a sliding window; once the threshold is reached, further
//! follow-ups for that pair are dropped (and logged) until the window
//! slides past. Pruning is lazy, on the next increment.

use crate::agentmesh::config::ErrorRoutingConfig;
use crate::agentmesh::errors::{ErrorCategory, ErrorInfo};
use crate::agentmesh::event::{Event, CAUSED_BY_METADATA_KEY, ERROR_EVENT_TYPE};
use crate::agentmesh::state::ROUTE_METADATA_KEY;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// What the router decided for one failure.
#[derive(Debug)]
pub enum RouteDecision {
    /// Routing is disabled; the failure surfaces to the trace only.
    Disabled,
    /// The failed event was itself an error event; dropped to prevent
    /// recursion.
    Recursive,
    /// No mapping resolved to a registered agent.
    NoHandler,
    /// The circuit breaker for this `(session, category)` is open.
    CircuitOpen,
    /// A follow-up event was produced for the named handler.
    Routed {
        /// The selected recovery agent.
        handler: String,
        /// The follow-up event to enqueue.
        event: Event,
    },
}

/// Translates failed dispatches into follow-up events for recovery agents.
pub struct ErrorRouter {
    config: ErrorRoutingConfig,
    // (session, category) → timestamps of routed failures inside the window.
    counters: Mutex<HashMap<(String, ErrorCategory), Vec<DateTime<Utc>>>>,
}

impl ErrorRouter {
    /// Create a router from its configuration.
    pub fn new(config: ErrorRoutingConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// `true` when routing is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Select the recovery handler for a failure, honoring precedence and
    /// skipping mappings whose target is not registered.
    pub fn select_handler(&self, info: &ErrorInfo, registered: &[String]) -> Option<String> {
        let known: HashSet<&str> = registered.iter().map(String::as_str).collect();
        let registered_only =
            |name: Option<&String>| name.filter(|n| known.contains(n.as_str())).cloned();

        registered_only(
            self.config
                .exact_handlers
                .get(&(info.category, info.severity)),
        )
        .or_else(|| registered_only(self.config.category_handlers.get(&info.category)))
        .or_else(|| registered_only(self.config.severity_handlers.get(&info.severity)))
        .or_else(|| registered_only(Some(&self.config.default_handler)))
    }

    /// Decide what to do with a failed dispatch.
    ///
    /// `session_id` is the resolved session of the failed event and
    /// `registered` the currently registered agent names.
    pub fn route(
        &self,
        session_id: &str,
        failed_event: &Event,
        info: &ErrorInfo,
        registered: &[String],
    ) -> RouteDecision {
        if !self.config.enabled {
            return RouteDecision::Disabled;
        }
        if failed_event.is_error_event() {
            return RouteDecision::Recursive;
        }
        let Some(handler) = self.select_handler(info, registered) else {
            return RouteDecision::NoHandler;
        };
        if !self.admit(session_id, info.category) {
            return RouteDecision::CircuitOpen;
        }

        let payload = json!({
            "error": info,
            "failed_event_id": failed_event.id(),
            "failed_event_type": failed_event.event_type(),
        });
        let event = Event::new(ERROR_EVENT_TYPE, payload)
            .with_metadata(CAUSED_BY_METADATA_KEY, failed_event.id())
            .with_metadata(ROUTE_METADATA_KEY, handler.clone())
            .with_session(session_id);

        RouteDecision::Routed { handler, event }
    }

    /// Sliding-window admission for `(session, category)`.
    ///
    /// Prunes expired timestamps, then admits while the in-window count is
    /// below the threshold.
    fn admit(&self, session_id: &str, category: ErrorCategory) -> bool {
        let threshold = self.config.circuit_breaker.threshold as usize;
        if threshold == 0 {
            return false;
        }
        let window = chrono::Duration::from_std(self.config.circuit_breaker.window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let now = Utc::now();

        let Ok(mut counters) = self.counters.lock() else {
            return false;
        };
        let timestamps = counters
            .entry((session_id.to_string(), category))
            .or_default();
        timestamps.retain(|t| now.signed_duration_since(*t) < window);

        if timestamps.len() >= threshold {
            false
        } else {
            timestamps.push(now);
            true
        }
    }
}
