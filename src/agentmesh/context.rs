//! Per-dispatch execution context handed to agent handlers.
//!
//! An [`AgentContext`] bundles the three cross-cutting capabilities every
//! handler can rely on: the shared [`Memory`](crate::Memory) handle, the
//! session scope, and a cancellation token derived from the runner's root
//! context. The runner builds one per event; the memory-aware handler
//! wrapper guarantees the memory and session fields are populated before a
//! handler runs, so handlers never need to null-check in the common path.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::{AgentContext, InMemoryMemory, Memory};
//! use std::sync::Arc;
//!
//! let memory = Arc::new(InMemoryMemory::new());
//! let session = memory.new_session();
//!
//! let ctx = AgentContext::new()
//!     .with_memory(memory)
//!     .with_session(session.clone());
//!
//! assert!(ctx.memory().is_some());
//! assert_eq!(ctx.session_id(), session);
//! assert!(!ctx.is_cancelled());
//! ```

use crate::agentmesh::memory::Memory;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Execution context carrying memory, session scope, and cancellation.
///
/// Contexts are cheap to clone (two `Arc`s and a token) and are rebuilt
/// rather than mutated: `with_session` returns a new context scoped to a
/// different session, leaving the original untouched.
#[derive(Clone)]
pub struct AgentContext {
    memory: Option<Arc<dyn Memory>>,
    session_id: String,
    cancellation: CancellationToken,
}

impl AgentContext {
    /// Create an empty context with a fresh, uncancelled token.
    pub fn new() -> Self {
        Self {
            memory: None,
            session_id: String::new(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Attach the shared memory handle (builder pattern).
    pub fn with_memory(mut self, memory: Arc<dyn Memory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Scope this context to a session (builder pattern).
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Attach a cancellation token (builder pattern).
    ///
    /// The runner passes a token derived from its root context so in-flight
    /// handlers observe shutdown.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// The shared memory handle, when one is configured.
    pub fn memory(&self) -> Option<Arc<dyn Memory>> {
        self.memory.clone()
    }

    /// The session this dispatch belongs to. Empty when unscoped.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The cancellation token for this dispatch.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// `true` once the runner has begun shutting down this dispatch.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl Default for AgentContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentContext")
            .field("session_id", &self.session_id)
            .field("has_memory", &self.memory.is_some())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
