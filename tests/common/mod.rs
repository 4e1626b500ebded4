#![allow(dead_code)]

use hooktail::{Event, EventKind};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A valid `file_touch` event as the raw JSON a producer would send.
pub fn raw_event(session: &str) -> Value {
    json!({
        "v": 1,
        "ts": 1.0,
        "type": "file_touch",
        "session_id": session,
        "path": "a",
        "kind": "read"
    })
}

/// The serialized log line for [`raw_event`], newline included.
pub fn raw_line(session: &str) -> String {
    let mut line = serde_json::to_string(&raw_event(session)).unwrap();
    line.push('\n');
    line
}

/// A typed `file_touch` event.
pub fn file_touch(session: &str) -> Event {
    let mut fields = Map::new();
    fields.insert("path".into(), json!("a"));
    fields.insert("kind".into(), json!("read"));
    let mut event = Event::new(EventKind::FileTouch, session, fields);
    event.ts = 1.0;
    event
}

/// An event carrying a canonical watcher ID at the given offset.
pub fn offset_event(offset: u64) -> Event {
    let mut event = file_touch("s");
    event.id = Some(hooktail::watcher_id(offset));
    event
}

/// Parse one batch envelope into its events array.
pub fn envelope_events(envelope: &str) -> Vec<Value> {
    let value: Value = serde_json::from_str(envelope).expect("envelope is JSON");
    assert_eq!(value["type"], "batch", "unexpected envelope type");
    value["events"].as_array().expect("events array").clone()
}

/// Receive batch envelopes until `n` events have arrived or the deadline
/// passes; returns the events in delivery order.
pub async fn collect_events(
    rx: &mut mpsc::Receiver<Arc<String>>,
    n: usize,
    deadline: Duration,
) -> Vec<Value> {
    let mut events = Vec::new();
    let _ = tokio::time::timeout(deadline, async {
        while events.len() < n {
            match rx.recv().await {
                Some(envelope) => events.extend(envelope_events(&envelope)),
                None => break,
            }
        }
    })
    .await;
    events
}

/// Receive batch envelopes (not flattened) until `n` batches arrived or
/// the deadline passes.
pub async fn collect_batches(
    rx: &mut mpsc::Receiver<Arc<String>>,
    n: usize,
    deadline: Duration,
) -> Vec<Vec<Value>> {
    let mut batches = Vec::new();
    let _ = tokio::time::timeout(deadline, async {
        while batches.len() < n {
            match rx.recv().await {
                Some(envelope) => batches.push(envelope_events(&envelope)),
                None => break,
            }
        }
    })
    .await;
    batches
}

/// Numeric offset of an event value's `id`.
pub fn offset_of(event: &Value) -> u64 {
    hooktail::id_offset(event["id"].as_str().expect("event id")).expect("numeric offset")
}
