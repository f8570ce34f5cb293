//! Shared state container passed between agents.
//!
//! [`State`] is the key/value payload that flows through a dispatch: the
//! orchestrator seeds it from the triggering event, each agent receives its
//! own independent clone, and agent outputs are merged back according to the
//! active orchestration discipline.
//!
//! A `State` carries two mappings:
//!
//! - **data**: string key → arbitrary [`serde_json::Value`]
//! - **metadata**: string key → string, for routing and bookkeeping
//!
//! Both mappings preserve insertion order when enumerated, so agents and
//! trace summaries see keys in the order they were written.
//!
//! # Reserved metadata keys
//!
//! - [`ROUTE_METADATA_KEY`] (`"route"`) — agent-name selector consumed by the
//!   route orchestrator.
//! - [`SESSION_ID_METADATA_KEY`] (`"session_id"`) — the session scope of the
//!   dispatch.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::State;
//! use serde_json::json;
//!
//! let mut state = State::new();
//! state.set("city", json!("Lisbon"));
//! state.set_meta("session_id", "s-42");
//!
//! // Clones are fully independent
//! let mut copy = state.clone();
//! copy.set("city", json!("Porto"));
//! assert_eq!(state.get("city"), Some(&json!("Lisbon")));
//! assert_eq!(copy.get("city"), Some(&json!("Porto")));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Metadata key read by the route orchestrator to select a target agent.
pub const ROUTE_METADATA_KEY: &str = "route";

/// Metadata key carrying the session scope of an event or state.
pub const SESSION_ID_METADATA_KEY: &str = "session_id";

/// Ordered key/value + metadata container carried across agents.
///
/// `State` is immutable by convention once it crosses an agent boundary:
/// every agent works on its own [`Clone`], and mutating a clone never
/// affects the original. Values are [`serde_json::Value`] so payloads of any
/// JSON shape can travel through a dispatch without the runtime caring about
/// their structure.
///
/// # Example
///
/// ```rust
/// use agentmesh::State;
/// use serde_json::json;
///
/// let mut state = State::new();
/// state.set("a", json!(1));
/// state.set("b", json!(2));
/// state.set("a", json!(3)); // overwrite keeps original position
///
/// assert_eq!(state.keys(), vec!["a".to_string(), "b".to_string()]);
/// assert_eq!(state.get("a"), Some(&json!(3)));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct State {
    data: HashMap<String, Value>,
    meta: HashMap<String, String>,
    data_order: Vec<String>,
    meta_order: Vec<String>,
}

impl State {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a state from an event payload.
    ///
    /// A JSON object spreads each top-level field into its own data key; any
    /// other payload shape (string, number, array, …) is stored whole under
    /// the key `"payload"`. Null payloads produce an empty state.
    ///
    /// # Example
    ///
    /// ```rust
    /// use agentmesh::State;
    /// use serde_json::json;
    ///
    /// let state = State::from_payload(&json!({"msg": "hi", "n": 7}));
    /// assert_eq!(state.get("msg"), Some(&json!("hi")));
    /// assert_eq!(state.get("n"), Some(&json!(7)));
    ///
    /// let scalar = State::from_payload(&json!("just text"));
    /// assert_eq!(scalar.get("payload"), Some(&json!("just text")));
    /// ```
    pub fn from_payload(payload: &Value) -> Self {
        let mut state = Self::new();
        match payload {
            Value::Object(map) => {
                for (key, value) in map {
                    state.set(key.clone(), value.clone());
                }
            }
            Value::Null => {}
            other => {
                state.set("payload", other.clone());
            }
        }
        state
    }

    /// Look up a data value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Insert or overwrite a data value.
    ///
    /// A new key is appended to the enumeration order; overwriting an
    /// existing key keeps its original position.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if !self.data.contains_key(&key) {
            self.data_order.push(key.clone());
        }
        self.data.insert(key, value);
    }

    /// Remove a data value, returning it if the key was present.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.data.remove(key);
        if removed.is_some() {
            self.data_order.retain(|k| k != key);
        }
        removed
    }

    /// Data keys in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.data_order.clone()
    }

    /// Look up a metadata value by key.
    pub fn get_meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    /// Insert or overwrite a metadata value.
    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if !self.meta.contains_key(&key) {
            self.meta_order.push(key.clone());
        }
        self.meta.insert(key, value.into());
    }

    /// Metadata keys in insertion order.
    pub fn meta_keys(&self) -> Vec<String> {
        self.meta_order.clone()
    }

    /// Union-merge another state into this one.
    ///
    /// Keys from `other` overwrite keys already present here; ordering of
    /// surviving keys is preserved, with genuinely new keys appended in
    /// `other`'s order. Both the data and metadata mappings are merged.
    pub fn merge(&mut self, other: &State) {
        for key in &other.data_order {
            if let Some(value) = other.data.get(key) {
                self.set(key.clone(), value.clone());
            }
        }
        for key in &other.meta_order {
            if let Some(value) = other.meta.get(key) {
                self.set_meta(key.clone(), value.clone());
            }
        }
    }

    /// Number of data entries.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` when the data mapping is empty.
    ///
    /// Metadata does not count: a state holding only bookkeeping metadata is
    /// still considered empty for result-validity purposes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clone_is_independent() {
        let mut original = State::new();
        original.set("k", json!("v"));
        original.set_meta("m", "1");

        let mut cloned = original.clone();
        assert_eq!(cloned, original);

        cloned.set("k", json!("changed"));
        cloned.set_meta("m", "2");
        cloned.set("extra", json!(true));

        assert_eq!(original.get("k"), Some(&json!("v")));
        assert_eq!(original.get_meta("m"), Some("1"));
        assert!(original.get("extra").is_none());
    }

    #[test]
    fn insertion_order_preserved() {
        let mut state = State::new();
        state.set("z", json!(1));
        state.set("a", json!(2));
        state.set("m", json!(3));
        state.set("a", json!(4)); // overwrite keeps position

        assert_eq!(state.keys(), vec!["z", "a", "m"]);
        assert_eq!(state.get("a"), Some(&json!(4)));
    }

    #[test]
    fn merge_overwrites_and_appends() {
        let mut base = State::new();
        base.set("shared", json!("old"));
        base.set("only_base", json!(1));

        let mut other = State::new();
        other.set("shared", json!("new"));
        other.set("only_other", json!(2));

        base.merge(&other);

        assert_eq!(base.get("shared"), Some(&json!("new")));
        assert_eq!(base.get("only_base"), Some(&json!(1)));
        assert_eq!(base.get("only_other"), Some(&json!(2)));
        assert_eq!(base.keys(), vec!["shared", "only_base", "only_other"]);
    }

    #[test]
    fn from_payload_shapes() {
        let obj = State::from_payload(&json!({"a": 1}));
        assert_eq!(obj.get("a"), Some(&json!(1)));

        let scalar = State::from_payload(&json!(42));
        assert_eq!(scalar.get("payload"), Some(&json!(42)));

        let null = State::from_payload(&json!(null));
        assert!(null.is_empty());
    }
}
