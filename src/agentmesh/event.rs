//! Typed events flowing through the runner queue.
//!
//! An [`Event`] is the unit of work in agentmesh: producers build one with a
//! free-form type string and a JSON payload, attach routing/session metadata,
//! and hand it to [`Runner::emit`](crate::Runner::emit). Workers dequeue
//! events and deliver them to agents through the active orchestrator.
//!
//! Events are immutable once emitted. Equality is identity: two events are
//! equal only when they share the same `id`, regardless of payload.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::Event;
//! use serde_json::json;
//!
//! let event = Event::new("user_message", json!({"msg": "hello"}))
//!     .with_metadata("route", "echo")
//!     .with_session("s-1");
//!
//! assert_eq!(event.event_type(), "user_message");
//! assert_eq!(event.session_id(), Some("s-1"));
//! assert_eq!(event.metadata().get("route").map(String::as_str), Some("echo"));
//! ```

use crate::agentmesh::state::SESSION_ID_METADATA_KEY;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Event type used for follow-up events produced by the error router.
pub const ERROR_EVENT_TYPE: &str = "error";

/// Metadata key linking a follow-up error event to the event that failed.
pub const CAUSED_BY_METADATA_KEY: &str = "caused_by";

/// A typed message with payload, metadata, timestamp, and a unique id.
///
/// The `id` is assigned at construction and never changes; retries of the
/// same event share it, so trace entries for all attempts correlate. The
/// session scope is derived from the `session_id` metadata key.
#[derive(Debug, Clone)]
pub struct Event {
    id: String,
    event_type: String,
    payload: Value,
    metadata: HashMap<String, String>,
    timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event with a fresh unique id and the current timestamp.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: format!("evt-{}", Uuid::new_v4()),
            event_type: event_type.into(),
            payload,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach a metadata key/value pair (builder pattern).
    ///
    /// # Example
    ///
    /// ```rust
    /// use agentmesh::Event;
    /// use serde_json::json;
    ///
    /// let event = Event::new("task", json!({}))
    ///     .with_metadata("route", "planner")
    ///     .with_metadata("priority", "high");
    /// assert_eq!(event.metadata().len(), 2);
    /// ```
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the session scope (builder pattern).
    ///
    /// Shorthand for `with_metadata("session_id", id)`.
    pub fn with_session(self, session_id: impl Into<String>) -> Self {
        self.with_metadata(SESSION_ID_METADATA_KEY, session_id)
    }

    /// Unique identifier assigned at construction.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Free-form type string chosen by the producer.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The structured payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// All metadata attached to this event.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Creation timestamp (UTC).
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Session scope derived from metadata, if present.
    pub fn session_id(&self) -> Option<&str> {
        self.metadata
            .get(SESSION_ID_METADATA_KEY)
            .map(String::as_str)
    }

    /// `true` when this is a follow-up event produced by the error router.
    pub fn is_error_event(&self) -> bool {
        self.event_type == ERROR_EVENT_TYPE
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}
