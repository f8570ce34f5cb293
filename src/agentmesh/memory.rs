//! Session-scoped memory capability.
//!
//! The runtime treats memory as an opaque, shared capability: one handle is
//! created alongside the runner, injected into every agent's
//! [`AgentContext`], and closed when the runner stops. Backends implement
//! the [`Memory`] trait; the crate ships [`InMemoryMemory`] so embedders can
//! run and test without any external service.
//!
//! All operations are session-scoped through the context: two sessions
//! never observe each other's entries. Implementations must be internally
//! thread-safe — the runner shares the handle across workers and never
//! serializes calls.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::{AgentContext, InMemoryMemory, Memory};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), agentmesh::MemoryError> {
//! let memory = Arc::new(InMemoryMemory::new());
//! let ctx = AgentContext::new().with_session(memory.new_session());
//!
//! memory.store(&ctx, "the deploy failed at step 3", &["incident".into()]).await?;
//! let hits = memory.query(&ctx, "deploy failed", 5).await?;
//! assert_eq!(hits.len(), 1);
//! assert!(hits[0].score > 0.0);
//! # Ok(())
//! # }
//! ```

use crate::agentmesh::context::AgentContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// Failure raised by a memory backend.
#[derive(Debug, Clone)]
pub enum MemoryError {
    /// The handle was used after `close()`.
    Closed,
    /// Backend-specific failure (connection loss, serialization, …).
    Backend(String),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::Closed => write!(f, "memory handle is closed"),
            MemoryError::Backend(msg) => write!(f, "memory backend failure: {}", msg),
        }
    }
}

impl Error for MemoryError {}

/// One scored hit returned by [`Memory::query`].
#[derive(Debug, Clone)]
pub struct MemoryResult {
    /// The stored content.
    pub content: String,
    /// Relevance score in `0.0..=1.0`.
    pub score: f32,
    /// Backend metadata (tags, timestamps, source identifiers).
    pub metadata: HashMap<String, String>,
}

/// One message returned by [`Memory::get_history`].
#[derive(Debug, Clone)]
pub struct MemoryMessage {
    /// Role of the entry's author (`"user"`, `"assistant"`, …).
    pub role: String,
    /// The stored content.
    pub content: String,
    /// When the entry was stored.
    pub timestamp: DateTime<Utc>,
}

/// The memory capability consumed by the core runtime.
///
/// Lifetime contract: the handle is created before the runner, shared
/// (never owned) by all agents, and closed by the runner at shutdown.
/// Every operation takes a context for session scoping and cancellation.
#[async_trait]
pub trait Memory: Send + Sync {
    /// Store content under the context's session, with optional tags.
    async fn store(
        &self,
        ctx: &AgentContext,
        content: &str,
        tags: &[String],
    ) -> Result<(), MemoryError>;

    /// Retrieve up to `limit` entries relevant to `query`, best first.
    async fn query(
        &self,
        ctx: &AgentContext,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryResult>, MemoryError>;

    /// The most recent `limit` entries of the session, oldest first.
    async fn get_history(
        &self,
        ctx: &AgentContext,
        limit: usize,
    ) -> Result<Vec<MemoryMessage>, MemoryError>;

    /// Mint a globally unique session id.
    fn new_session(&self) -> String;

    /// Release backend resources. Further operations fail with
    /// [`MemoryError::Closed`].
    async fn close(&self) -> Result<(), MemoryError>;
}

#[derive(Debug, Clone)]
struct StoredEntry {
    content: String,
    tags: Vec<String>,
    timestamp: DateTime<Utc>,
}

/// In-memory reference backend.
///
/// Entries live in a per-session vector behind a mutex. Queries score by
/// word-set overlap between the query and each entry (a Jaccard-style
/// measure), which is enough for tests and small embedded deployments.
#[derive(Debug, Default)]
pub struct InMemoryMemory {
    sessions: Mutex<HashMap<String, Vec<StoredEntry>>>,
    closed: AtomicBool,
}

impl InMemoryMemory {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries stored under a session.
    pub fn session_len(&self, session_id: &str) -> usize {
        self.sessions
            .lock()
            .map(|s| s.get(session_id).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    fn ensure_open(&self) -> Result<(), MemoryError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MemoryError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Memory for InMemoryMemory {
    async fn store(
        &self,
        ctx: &AgentContext,
        content: &str,
        tags: &[String],
    ) -> Result<(), MemoryError> {
        self.ensure_open()?;
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| MemoryError::Backend("store lock poisoned".into()))?;
        sessions
            .entry(ctx.session_id().to_string())
            .or_default()
            .push(StoredEntry {
                content: content.to_string(),
                tags: tags.to_vec(),
                timestamp: Utc::now(),
            });
        Ok(())
    }

    async fn query(
        &self,
        ctx: &AgentContext,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryResult>, MemoryError> {
        self.ensure_open()?;
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| MemoryError::Backend("store lock poisoned".into()))?;

        let mut hits: Vec<MemoryResult> = sessions
            .get(ctx.session_id())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let score = word_overlap(query, &entry.content);
                        if score <= 0.0 {
                            return None;
                        }
                        let mut metadata = HashMap::new();
                        metadata.insert("timestamp".to_string(), entry.timestamp.to_rfc3339());
                        if !entry.tags.is_empty() {
                            metadata.insert("tags".to_string(), entry.tags.join(","));
                        }
                        Some(MemoryResult {
                            content: entry.content.clone(),
                            score,
                            metadata,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn get_history(
        &self,
        ctx: &AgentContext,
        limit: usize,
    ) -> Result<Vec<MemoryMessage>, MemoryError> {
        self.ensure_open()?;
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| MemoryError::Backend("store lock poisoned".into()))?;

        let messages = sessions
            .get(ctx.session_id())
            .map(|entries| {
                let start = entries.len().saturating_sub(limit);
                entries[start..]
                    .iter()
                    .map(|entry| MemoryMessage {
                        role: entry
                            .tags
                            .iter()
                            .find_map(|t| t.strip_prefix("role:").map(str::to_string))
                            .unwrap_or_else(|| "user".to_string()),
                        content: entry.content.clone(),
                        timestamp: entry.timestamp,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(messages)
    }

    fn new_session(&self) -> String {
        format!("session-{}", Uuid::new_v4())
    }

    async fn close(&self) -> Result<(), MemoryError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Word-set overlap between two texts, `0.0..=1.0`.
///
/// Both texts are lowercased and tokenized on whitespace; words shorter
/// than three characters are ignored to reduce noise from articles and
/// prepositions.
fn word_overlap(query: &str, content: &str) -> f32 {
    let normalize = |text: &str| -> HashSet<String> {
        text.to_lowercase()
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
            .filter(|w| w.len() > 2)
            .collect()
    };

    let query_words = normalize(query);
    let content_words = normalize(content);
    if query_words.is_empty() || content_words.is_empty() {
        return 0.0;
    }

    let matched = query_words.intersection(&content_words).count();
    matched as f32 / query_words.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(session: &str) -> AgentContext {
        AgentContext::new().with_session(session)
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let memory = InMemoryMemory::new();
        memory.store(&ctx("a"), "alpha fact", &[]).await.unwrap();
        memory.store(&ctx("b"), "beta fact", &[]).await.unwrap();

        let history_a = memory.get_history(&ctx("a"), 10).await.unwrap();
        assert_eq!(history_a.len(), 1);
        assert_eq!(history_a[0].content, "alpha fact");

        let hits = memory.query(&ctx("b"), "alpha fact", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "beta fact");
    }

    #[tokio::test]
    async fn query_ranks_by_overlap() {
        let memory = InMemoryMemory::new();
        let ctx = ctx("s");
        memory
            .store(&ctx, "deploy pipeline failed with timeout", &[])
            .await
            .unwrap();
        memory.store(&ctx, "unrelated grocery list", &[]).await.unwrap();

        let hits = memory.query(&ctx, "deploy failed", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("deploy"));
    }

    #[tokio::test]
    async fn history_is_bounded_and_oldest_first() {
        let memory = InMemoryMemory::new();
        let ctx = ctx("s");
        for i in 0..5 {
            memory.store(&ctx, &format!("entry {}", i), &[]).await.unwrap();
        }

        let history = memory.get_history(&ctx, 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "entry 3");
        assert_eq!(history[1].content, "entry 4");
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let memory = InMemoryMemory::new();
        memory.close().await.unwrap();

        let err = memory.store(&ctx("s"), "late", &[]).await.unwrap_err();
        assert!(matches!(err, MemoryError::Closed));
    }

    #[test]
    fn session_ids_are_unique() {
        let memory = InMemoryMemory::new();
        assert_ne!(memory.new_session(), memory.new_session());
    }
}
