mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::raw_event;
use hooktail::{
    AppState, Broadcaster, EventWriter, LOG_FILE_NAME, WatcherStatus, router,
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::sync::{Mutex, RwLock};
use tower::ServiceExt;

fn app(dir: &Path) -> Router {
    let writer = EventWriter::open(dir).unwrap();
    let reader = writer.reader();
    router(AppState {
        writer: Arc::new(Mutex::new(writer)),
        reader,
        broadcaster: Broadcaster::new(),
        watcher_status: Arc::new(RwLock::new(WatcherStatus::default())),
    })
}

async fn post_event(app: Router, body: String) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/event")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_ingest_appends_valid_event() {
    let dir = tempdir().unwrap();
    let body = serde_json::to_string(&raw_event("s1")).unwrap();
    let (status, value) = post_event(app(dir.path()), body).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(value, json!({"ok": true}));

    let log = fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
    assert!(log.ends_with('\n'));
    let line: Value = serde_json::from_str(log.trim_end()).unwrap();
    assert_eq!(line["session_id"], "s1");
    assert_eq!(line["type"], "file_touch");
    assert!(line.get("id").is_none(), "the ingest path never assigns ids");
}

#[tokio::test]
async fn test_ingest_rejects_bad_json() {
    let dir = tempdir().unwrap();
    let (status, value) = post_event(app(dir.path()), "{not json".to_string()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["error"], "bad_json");
    assert_eq!(
        fs::read(dir.path().join(LOG_FILE_NAME)).unwrap().len(),
        0,
        "nothing is appended on failure"
    );
}

#[tokio::test]
async fn test_ingest_rejects_invalid_event_with_details() {
    let dir = tempdir().unwrap();
    let body = serde_json::to_string(&json!({
        "v": 1, "ts": 1.0, "type": "file_touch", "session_id": ""
    }))
    .unwrap();
    let (status, value) = post_event(app(dir.path()), body).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["error"], "invalid_event");
    let fields: Vec<_> = value["details"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["field"].as_str().unwrap().to_string())
        .collect();
    assert!(fields.contains(&"session_id".to_string()));
    assert!(fields.contains(&"path".to_string()));
}

#[tokio::test]
async fn test_ingest_rejects_oversize_body() {
    let dir = tempdir().unwrap();
    let huge = format!(r#"{{"pad":"{}"}}"#, "x".repeat(1024 * 1024 + 1));
    let (status, _) = post_event(app(dir.path()), huge).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_history_mints_offset_ids() {
    let dir = tempdir().unwrap();
    let app = app(dir.path());
    for session in ["a", "bb", "ccc"] {
        let body = serde_json::to_string(&raw_event(session)).unwrap();
        let (status, _) = post_event(app.clone(), body).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, value) = get_json(app.clone(), "/api/events?tail=2").await;
    assert_eq!(status, StatusCode::OK);
    let events = value["events"].as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["session_id"], "bb");
    assert_eq!(events[1]["session_id"], "ccc");

    // IDs are computed byte-exactly from line starts, same rule as the
    // live watcher.
    let log = fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
    let lines: Vec<&str> = log.split_inclusive('\n').collect();
    let second_start = lines[0].len();
    let third_start = lines[0].len() + lines[1].len();
    assert_eq!(events[0]["id"], format!("file_watcher:{second_start}"));
    assert_eq!(events[1]["id"], format!("file_watcher:{third_start}"));
}

#[tokio::test]
async fn test_history_pages_before_timestamp() {
    let dir = tempdir().unwrap();
    let app = app(dir.path());
    for (session, ts) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
        let mut raw = raw_event(session);
        raw["ts"] = json!(ts);
        let body = serde_json::to_string(&raw).unwrap();
        let (status, _) = post_event(app.clone(), body).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, value) = get_json(app.clone(), "/api/events?before_ts=3&limit=1").await;
    assert_eq!(status, StatusCode::OK);
    let events = value["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["session_id"], "b");
    assert_eq!(value["next_before"], json!(2.0));

    // The next page ends the walk.
    let (_, value) = get_json(app, "/api/events?before_ts=2&limit=1").await;
    let events = value["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["session_id"], "a");
    assert_eq!(value["next_before"], Value::Null);
}

#[tokio::test]
async fn test_history_defaults_to_tail_of_log() {
    let dir = tempdir().unwrap();
    let app = app(dir.path());
    let body = serde_json::to_string(&raw_event("only")).unwrap();
    post_event(app.clone(), body).await;

    let (status, value) = get_json(app, "/api/events").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["events"].as_array().unwrap().len(), 1);
    assert_eq!(value["next_before"], Value::Null);
}

#[tokio::test]
async fn test_stats_probe_shape() {
    let dir = tempdir().unwrap();
    let app = app(dir.path());
    let body = serde_json::to_string(&raw_event("s")).unwrap();
    post_event(app.clone(), body).await;

    let (status, value) = get_json(app, "/api/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["clients"], 0);
    assert_eq!(value["queue_depth"], 0);
    assert_eq!(value["events_dropped"], 0);
    assert!(value["log_size"].as_u64().unwrap() > 0);
    assert!(value["log_signature"].as_u64().unwrap() > 0);
    assert_eq!(value["watcher"]["offset"], 0);
    assert_eq!(value["watcher"]["consecutive_errors"], 0);
}
