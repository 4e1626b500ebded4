//! HTTP and WebSocket surface: ingest, historical reads, stats, and the
//! live event stream.

use crate::broadcast::Broadcaster;
use crate::event::{self, Event, FieldError};
use crate::log::{EventReader, EventWriter};
use crate::stats;
use crate::watcher::WatcherStatus;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        DefaultBodyLimit, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Ingest request bodies are capped at this size.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Inbound WebSocket messages are capped at this size. Defensive only:
/// the core ignores their content entirely.
pub const MAX_WS_INBOUND_BYTES: usize = 1024 * 1024;

/// Default and maximum page size for historical reads.
pub const DEFAULT_PAGE_LIMIT: usize = 1000;

/// Shared handles behind every route.
#[derive(Clone)]
pub struct AppState {
    /// Exclusive append handle for the ingest sink.
    pub writer: Arc<Mutex<EventWriter>>,
    /// Reader for historical queries and log probes.
    pub reader: EventReader,
    /// The fan-out queue.
    pub broadcaster: Arc<Broadcaster>,
    /// Watcher state as published by the watcher task.
    pub watcher_status: Arc<RwLock<WatcherStatus>>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// API error kinds, mapped onto HTTP statuses.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request body exceeded the size cap.
    #[error("request body exceeds {MAX_BODY_BYTES} bytes")]
    TooLarge,
    /// Request body was not parseable JSON.
    #[error("request body is not valid JSON: {0}")]
    BadJson(String),
    /// Event failed schema validation.
    #[error("event failed validation")]
    InvalidEvent(Vec<FieldError>),
    /// Filesystem failure while serving the request.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, details) = match &self {
            ApiError::TooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "too_large", None),
            ApiError::BadJson(msg) => (StatusCode::BAD_REQUEST, "bad_json", Some(json!(msg))),
            ApiError::InvalidEvent(errors) => {
                (StatusCode::BAD_REQUEST, "invalid_event", Some(json!(errors)))
            }
            ApiError::Io(e) => {
                tracing::error!(error = %e, "request failed on I/O");
                (StatusCode::INTERNAL_SERVER_ERROR, "io", None)
            }
        };
        let mut body = json!({ "error": kind });
        if let Some(details) = details {
            body["details"] = details;
        }
        (status, Json(body)).into_response()
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/event", post(ingest))
        .route("/api/events", get(history))
        .route("/api/stats", get(stats_probe))
        .route("/ws", get(ws_upgrade))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// The ingest sink: size-cap, parse, validate, append.
///
/// Deliberately does not broadcast: the watcher observes the append via
/// the filesystem and is the single minting authority for canonical IDs.
async fn ingest(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if body.len() > MAX_BODY_BYTES {
        return Err(ApiError::TooLarge);
    }
    let raw: Value =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadJson(e.to_string()))?;
    event::validate(&raw).map_err(ApiError::InvalidEvent)?;
    let event: Event =
        serde_json::from_value(raw).map_err(|e| ApiError::BadJson(e.to_string()))?;

    state.writer.lock().await.append(&event)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    tail: Option<usize>,
    before_ts: Option<f64>,
    limit: Option<usize>,
}

/// Historical reads over the append log.
///
/// IDs are minted with the same `file_watcher:<offset>` rule as the live
/// tail, from byte-exact line-start offsets. Pages are returned in
/// ascending log order; `next_before` points at the oldest returned `ts`
/// when older matching events remain.
async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, DEFAULT_PAGE_LIMIT);

    let reader = state.reader.clone();
    let (records, next_before) = tokio::task::spawn_blocking(move || {
        if let Some(ts) = query.before_ts {
            let (page, truncated) = reader.page_before(ts, limit)?;
            let next = if truncated {
                page.first().map(|r| r.event.ts)
            } else {
                None
            };
            Ok::<_, io::Error>((page, next))
        } else {
            let n = query.tail.unwrap_or(limit).min(limit);
            Ok((reader.tail(n)?, None))
        }
    })
    .await
    .map_err(io::Error::other)??;

    let events: Vec<Event> = records
        .into_iter()
        .map(|record| {
            let mut event = record.event;
            event.id = Some(event::watcher_id(record.start_offset));
            event
        })
        .collect();

    Ok(Json(json!({ "events": events, "next_before": next_before })))
}

async fn stats_probe(State(state): State<AppState>) -> Json<stats::StatsSnapshot> {
    Json(stats::gather(&state.broadcaster, &state.watcher_status, &state.reader).await)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(MAX_WS_INBOUND_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// One subscriber session: register with the fan-out queue, forward
/// envelopes until either side goes away, then release.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (session_id, mut envelopes) = state.broadcaster.register();
    tracing::info!(session = %session_id, "subscriber connected");

    let forward = tokio::spawn(async move {
        while let Some(envelope) = envelopes.recv().await {
            let frame = Message::Text(envelope.as_str().into());
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    // Client-to-server messages are ignored by the core; the read loop
    // exists only to notice disconnection.
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.broadcaster.unregister(session_id);
    forward.abort();
    tracing::info!(session = %session_id, "subscriber disconnected");
}
