//! Per-session trace of hook firings, retries, and routing decisions.
//!
//! Every hook firing in a dispatch appends one [`TraceEntry`] through a
//! shared [`TraceLogger`]. The runner adds entries for dispatch outcomes,
//! retries, dropped follow-ups, and circuit-breaker trips, so
//! [`Runner::dump_trace`](crate::Runner::dump_trace) reconstructs the full
//! chronological story of a session.
//!
//! Two implementations ship with the crate:
//!
//! - [`InMemoryTraceLogger`] — mutex-protected vector, required for tests.
//! - [`FileTraceLogger`] — same in-memory buffer, plus
//!   [`dump`](FileTraceLogger::dump) which writes one
//!   `<session_id>.trace.json` file per session. Files are written
//!   atomically (temp file + rename) and contain the whole JSON array;
//!   they are never appended to incrementally.
//!
//! # Disk format
//!
//! ```text
//! [
//!   {"session_id":"s-1","event_id":"evt-...","agent_name":null,
//!    "hook":"before_event_handling","timestamp":"2025-07-01T12:00:00Z",
//!    "error":null,"result":null},
//!   {"session_id":"s-1","event_id":"evt-...","agent_name":"echo",
//!    "hook":"after_agent_run","timestamp":"2025-07-01T12:00:01Z",
//!    "error":null,"result":"out=\"hi\""}
//! ]
//! ```

use crate::agentmesh::state::State;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Upper bound on the `result` summary of a trace entry, in bytes.
pub const RESULT_SUMMARY_LIMIT: usize = 4096;

/// Per-value truncation applied before the total bound.
const VALUE_PREVIEW_LIMIT: usize = 120;

/// One appended record of a hook firing or runner decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEntry {
    /// Session this entry belongs to.
    pub session_id: String,
    /// Id of the event being dispatched.
    pub event_id: String,
    /// Agent involved, when the entry is agent-scoped.
    pub agent_name: Option<String>,
    /// Hook point or runner decision label (e.g. `"before_agent_run"`,
    /// `"retry"`, `"circuit_breaker"`).
    pub hook: String,
    /// When the entry was recorded (UTC, RFC 3339 on disk).
    pub timestamp: DateTime<Utc>,
    /// Error description, when the firing carried one.
    pub error: Option<String>,
    /// Bounded summary of the output state, when one was available.
    pub result: Option<String>,
}

impl TraceEntry {
    /// Create an entry for the given session, event, and hook label.
    pub fn new(
        session_id: impl Into<String>,
        event_id: impl Into<String>,
        hook: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            event_id: event_id.into(),
            agent_name: None,
            hook: hook.into(),
            timestamp: Utc::now(),
            error: None,
            result: None,
        }
    }

    /// Attach the involved agent's name (builder pattern).
    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    /// Attach an error description (builder pattern).
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach a result summary (builder pattern).
    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }
}

/// Bounded stringification of a state for trace summaries.
///
/// Lists keys in insertion order with value previews truncated to keep each
/// entry small; the whole summary is capped at [`RESULT_SUMMARY_LIMIT`]
/// bytes so traces cannot grow without bound.
pub fn summarize_state(state: &State) -> String {
    let mut summary = String::new();
    for key in state.keys() {
        let rendered = state
            .get(&key)
            .map(|v| v.to_string())
            .unwrap_or_default();
        let preview: String = rendered.chars().take(VALUE_PREVIEW_LIMIT).collect();
        let fragment = if summary.is_empty() {
            format!("{}={}", key, preview)
        } else {
            format!(", {}={}", key, preview)
        };
        if summary.len() + fragment.len() > RESULT_SUMMARY_LIMIT {
            summary.push_str(", …");
            break;
        }
        summary.push_str(&fragment);
    }
    summary
}

/// Append-only, session-filtered log of [`TraceEntry`] records.
///
/// Implementations must be thread-safe; `get_trace` returns an independent
/// copy of the matching entries in insertion order.
pub trait TraceLogger: Send + Sync {
    /// Append one entry.
    fn log(&self, entry: TraceEntry);

    /// All entries for the given session, in insertion order.
    fn get_trace(&self, session_id: &str) -> Vec<TraceEntry>;
}

/// In-memory trace logger backed by a mutex-protected vector.
///
/// # Example
///
/// ```rust
/// use agentmesh::{InMemoryTraceLogger, TraceEntry, TraceLogger};
///
/// let logger = InMemoryTraceLogger::new();
/// logger.log(TraceEntry::new("s-1", "evt-1", "before_event_handling"));
/// logger.log(TraceEntry::new("s-2", "evt-2", "before_event_handling"));
///
/// assert_eq!(logger.get_trace("s-1").len(), 1);
/// assert_eq!(logger.get_trace("s-2").len(), 1);
/// assert!(logger.get_trace("s-3").is_empty());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryTraceLogger {
    entries: Mutex<Vec<TraceEntry>>,
}

impl InMemoryTraceLogger {
    /// Create an empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of entries across all sessions.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// `true` when no entries have been logged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TraceLogger for InMemoryTraceLogger {
    fn log(&self, entry: TraceEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    fn get_trace(&self, session_id: &str) -> Vec<TraceEntry> {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.session_id == session_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Trace logger that can persist a session's entries to disk.
///
/// Entries accumulate in memory exactly like [`InMemoryTraceLogger`];
/// [`dump`](FileTraceLogger::dump) snapshots one session into
/// `<session_id>.trace.json` inside the configured directory.
///
/// # Example
///
/// ```rust,no_run
/// use agentmesh::{FileTraceLogger, TraceEntry, TraceLogger};
///
/// # fn main() -> std::io::Result<()> {
/// let logger = FileTraceLogger::new("traces")?;
/// logger.log(TraceEntry::new("s-1", "evt-1", "before_event_handling"));
///
/// let path = logger.dump("s-1")?;
/// assert!(path.ends_with("s-1.trace.json"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct FileTraceLogger {
    inner: InMemoryTraceLogger,
    dir: PathBuf,
}

impl FileTraceLogger {
    /// Create a logger persisting into `dir`, creating it if needed.
    pub fn new(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            inner: InMemoryTraceLogger::new(),
            dir,
        })
    }

    /// Write the session's entries to `<session_id>.trace.json`.
    ///
    /// The file is replaced wholesale on every call: entries are serialized
    /// to a temp file which is then renamed over the target, so readers
    /// never observe a partially-written trace.
    pub fn dump(&self, session_id: &str) -> io::Result<PathBuf> {
        let entries = self.inner.get_trace(session_id);
        let path = self.dir.join(trace_file_name(session_id));
        write_trace_file(&path, &entries)?;
        Ok(path)
    }

    /// Directory trace files are written into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl TraceLogger for FileTraceLogger {
    fn log(&self, entry: TraceEntry) {
        self.inner.log(entry);
    }

    fn get_trace(&self, session_id: &str) -> Vec<TraceEntry> {
        self.inner.get_trace(session_id)
    }
}

/// Derive the trace filename for a session id.
///
/// Non-alphanumeric characters other than `-` and `_` are replaced with `_`
/// for filesystem safety.
pub fn trace_file_name(session_id: &str) -> String {
    let safe: String = session_id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.trace.json", safe)
}

/// Atomically write a trace file: serialize to `<path>.tmp`, then rename.
pub(crate) fn write_trace_file(path: &Path, entries: &[TraceEntry]) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(entries)
        .map_err(|e| io::Error::other(format!("failed to serialize trace: {}", e)))?;

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entries_filtered_by_session_in_order() {
        let logger = InMemoryTraceLogger::new();
        logger.log(TraceEntry::new("a", "e1", "h1"));
        logger.log(TraceEntry::new("b", "e2", "h1"));
        logger.log(TraceEntry::new("a", "e3", "h2"));

        let trace = logger.get_trace("a");
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].event_id, "e1");
        assert_eq!(trace[1].event_id, "e3");
    }

    #[test]
    fn get_trace_copies_entries() {
        let logger = InMemoryTraceLogger::new();
        logger.log(TraceEntry::new("a", "e1", "h1"));

        let first = logger.get_trace("a");
        let second = logger.get_trace("a");
        assert_eq!(first, second);
    }

    #[test]
    fn summary_respects_bound() {
        let mut state = State::new();
        let big = "x".repeat(10_000);
        for i in 0..100 {
            state.set(format!("key{}", i), json!(big.clone()));
        }

        let summary = summarize_state(&state);
        assert!(summary.len() <= RESULT_SUMMARY_LIMIT + 8);
        assert!(summary.starts_with("key0="));
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(trace_file_name("s-1"), "s-1.trace.json");
        assert_eq!(trace_file_name("a/b c"), "a_b_c.trace.json");
    }
}
