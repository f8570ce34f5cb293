use agentmesh::{FileTraceLogger, TraceEntry, TraceLogger};
use serde_json::Value;
use std::fs;

fn entry(session: &str, event: &str, hook: &str) -> TraceEntry {
    TraceEntry::new(session, event, hook)
}

#[test]
fn dump_writes_one_json_array_per_session() {
    let dir = tempfile::tempdir().unwrap();
    let logger = FileTraceLogger::new(dir.path()).unwrap();

    logger.log(entry("s-1", "evt-1", "before_event_handling").with_agent("echo"));
    logger.log(
        entry("s-1", "evt-1", "after_agent_run")
            .with_agent("echo")
            .with_result("out=\"hi\""),
    );
    logger.log(entry("s-2", "evt-2", "before_event_handling"));

    let path = logger.dump("s-1").unwrap();
    assert!(path.ends_with("s-1.trace.json"));
    assert!(!dir.path().join("s-2.trace.json").exists());

    let raw = fs::read_to_string(&path).unwrap();
    let parsed: Vec<Value> = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0]["session_id"], "s-1");
    assert_eq!(parsed[0]["hook"], "before_event_handling");
    assert_eq!(parsed[0]["agent_name"], "echo");
    assert_eq!(parsed[0]["error"], Value::Null);
    assert_eq!(parsed[1]["result"], "out=\"hi\"");

    // RFC 3339 timestamps.
    let stamp = parsed[0]["timestamp"].as_str().unwrap();
    assert!(stamp.contains('T'), "timestamp should be RFC 3339: {}", stamp);

    // Entries round-trip through the on-disk format.
    let reloaded: Vec<TraceEntry> = serde_json::from_str(&raw).unwrap();
    assert_eq!(reloaded, logger.get_trace("s-1"));
}

#[test]
fn dump_replaces_the_file_wholesale() {
    let dir = tempfile::tempdir().unwrap();
    let logger = FileTraceLogger::new(dir.path()).unwrap();

    logger.log(entry("s", "e1", "before_event_handling"));
    let path = logger.dump("s").unwrap();
    let first: Vec<Value> = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(first.len(), 1);

    logger.log(entry("s", "e2", "after_event_handling"));
    logger.dump("s").unwrap();
    let second: Vec<Value> = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(second.len(), 2);

    // No leftover temp artifacts after a successful dump.
    let stray: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
        .collect();
    assert!(stray.is_empty());
}

#[test]
fn dump_twice_with_no_activity_is_identical() {
    let dir = tempfile::tempdir().unwrap();
    let logger = FileTraceLogger::new(dir.path()).unwrap();
    logger.log(entry("s", "e1", "before_event_handling"));

    let path = logger.dump("s").unwrap();
    let first = fs::read_to_string(&path).unwrap();
    logger.dump("s").unwrap();
    let second = fs::read_to_string(&path).unwrap();
    assert_eq!(first, second);
}

#[test]
fn session_ids_are_sanitized_into_filenames() {
    let dir = tempfile::tempdir().unwrap();
    let logger = FileTraceLogger::new(dir.path()).unwrap();
    logger.log(entry("weird/../id", "e", "before_event_handling"));

    let path = logger.dump("weird/../id").unwrap();
    assert_eq!(path.parent().unwrap(), dir.path());
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.ends_with(".trace.json"));
    assert!(!name.contains('/') && !name.contains(".."));
}
