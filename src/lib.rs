#![warn(missing_docs)]

//! # hooktail
//!
//! A local telemetry pipeline for developer-agent activity.
//!
//! Editor hooks POST events to an ingest endpoint, which appends them to a
//! single append-only JSONL log. A tailing watcher observes the log through
//! the filesystem, assigns each line a canonical ID derived from its byte
//! offset, and fans events out to browser clients over long-lived
//! WebSockets as ordered batches, with explicit gap markers wherever
//! backpressure forces loss.
//!
//! The watcher, not the ingest endpoint, is the single source of
//! canonical IDs: every delivered event carries an ID any reader of the
//! log can recompute.
//!
//! ## Quick start
//!
//! ```
//! # use tempfile::tempdir;
//! use hooktail::{Event, EventKind, EventWriter, TailState};
//! use serde_json::Map;
//!
//! # let dir = tempdir().unwrap();
//! let mut writer = EventWriter::open(dir.path()).unwrap();
//! let mut fields = Map::new();
//! fields.insert("path".into(), "src/main.rs".into());
//! fields.insert("kind".into(), "read".into());
//! writer.append(&Event::new(EventKind::FileTouch, "sess-1", fields)).unwrap();
//!
//! // The watcher frames complete lines and mints IDs by byte offset.
//! let mut tail = TailState::default();
//! let bytes = std::fs::read(writer.log_path()).unwrap();
//! let events = tail.absorb(&bytes);
//! assert_eq!(events[0].id.as_deref(), Some("file_watcher:0"));
//! ```
//!
//! ## Data flow
//!
//! producer → ingest ([`server`]) → append log ([`log`]) → watcher
//! ([`watcher`]) → fan-out queue ([`broadcast`]) → client sessions
//! ([`session`]).

pub mod broadcast;
pub mod event;
pub mod log;
pub mod server;
pub mod session;
pub mod stats;
pub mod watcher;

pub use broadcast::{BroadcastStats, Broadcaster};
pub use event::{Event, EventKind, FieldError, id_offset, validate, watcher_id};
pub use log::{AppendResult, EventReader, EventWriter, LOG_FILE_NAME, LockMode, LogRecord};
pub use server::{ApiError, AppState, router};
pub use session::ClientSession;
pub use stats::StatsSnapshot;
pub use watcher::{TailState, WatcherHandle, WatcherStatus, spawn_watcher};
