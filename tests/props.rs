use hooktail::{Event, EventKind, EventWriter, LockMode, TailState, watcher_id};
use proptest::prelude::*;
use serde_json::{Map, json};
use std::fs;
use tempfile::tempdir;

fn arb_session() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("alpha".to_string()),
        Just("beta".to_string()),
        Just("gamma".to_string()),
        Just("delta".to_string()),
    ]
}

fn arb_event() -> impl Strategy<Value = Event> {
    (arb_session(), 0u64..100).prop_map(|(session, n)| {
        let mut fields = Map::new();
        fields.insert("path".into(), json!(format!("src/file_{n}.rs")));
        fields.insert("kind".into(), json!(if n % 2 == 0 { "read" } else { "write" }));
        let mut event = Event::new(EventKind::FileTouch, &session, fields);
        event.ts = n as f64;
        event
    })
}

/// Serialize events into a log byte stream, returning the stream and each
/// line's start offset.
fn serialize_stream(events: &[Event]) -> (Vec<u8>, Vec<u64>) {
    let mut stream = Vec::new();
    let mut offsets = Vec::new();
    for event in events {
        offsets.push(stream.len() as u64);
        stream.extend(serde_json::to_string(event).unwrap().into_bytes());
        stream.push(b'\n');
    }
    (stream, offsets)
}

// Framing is invariant under arbitrary chunking: however the byte stream
// is split across reads, the same events come out with the same IDs.
proptest! {
    #[test]
    fn prop_framing_invariant_under_chunking(
        events in proptest::collection::vec(arb_event(), 1..20),
        cuts in proptest::collection::vec(0usize..10_000, 0..8),
    ) {
        let (stream, offsets) = serialize_stream(&events);

        let mut points: Vec<usize> = cuts.iter().map(|c| c % stream.len()).collect();
        points.sort_unstable();
        points.dedup();

        let mut tail = TailState::default();
        let mut emitted = Vec::new();
        let mut prev = 0;
        for point in points {
            emitted.extend(tail.absorb(&stream[prev..point]));
            prev = point;
        }
        emitted.extend(tail.absorb(&stream[prev..]));

        prop_assert_eq!(emitted.len(), events.len());
        for (event, offset) in emitted.iter().zip(&offsets) {
            let expected_id = watcher_id(*offset);
            prop_assert_eq!(event.id.as_deref(), Some(expected_id.as_str()));
        }
        prop_assert_eq!(tail.carry_len(), 0, "a complete stream leaves no carry");
    }
}

// Serialize-then-parse of a validated event yields an equal event.
proptest! {
    #[test]
    fn prop_serialize_parse_identity(event in arb_event()) {
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(parsed, event);
    }
}

// Re-reading the log from offset 0 yields the same ID sequence as live
// tailing did.
proptest! {
    #[test]
    fn prop_reread_matches_live_ids(
        events in proptest::collection::vec(arb_event(), 0..30)
    ) {
        let dir = tempdir().unwrap();
        let mut writer = EventWriter::open_with_lock(dir.path(), LockMode::None).unwrap();
        let reader = writer.reader();

        let mut appended = Vec::new();
        for event in &events {
            appended.push(writer.append(event).unwrap().start_offset);
        }

        // Live tail over the full stream.
        let bytes = fs::read(writer.log_path()).unwrap();
        let mut tail = TailState::default();
        let live: Vec<u64> = tail
            .absorb(&bytes)
            .iter()
            .filter_map(Event::offset)
            .collect();

        // Historical re-read.
        let reread: Vec<u64> = reader
            .records_from(0)
            .unwrap()
            .map(|r| r.unwrap().start_offset)
            .collect();

        prop_assert_eq!(&live, &appended);
        prop_assert_eq!(&reread, &appended);
    }
}
