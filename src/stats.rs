//! Read-only introspection over the pipeline's moving parts.
//!
//! Snapshots are assembled from each owner's published state and may be
//! momentarily inconsistent with one another; they feed health checks and
//! tests, never correctness.

use crate::broadcast::{BroadcastStats, Broadcaster};
use crate::log::EventReader;
use crate::watcher::WatcherStatus;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One stats probe reading.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Fan-out queue counters.
    #[serde(flatten)]
    pub broadcast: BroadcastStats,
    /// Watcher state as last published by the watcher task.
    pub watcher: WatcherStatus,
    /// Current size of the append log in bytes.
    pub log_size: u64,
    /// xxh64 signature identifying the current log contents
    /// (0 for an empty log).
    pub log_signature: u64,
}

/// Assemble a snapshot. Log probes are best-effort: a transient I/O
/// failure reads as zero rather than failing the probe.
pub async fn gather(
    broadcaster: &Broadcaster,
    watcher: &Arc<RwLock<WatcherStatus>>,
    reader: &EventReader,
) -> StatsSnapshot {
    StatsSnapshot {
        broadcast: broadcaster.stats(),
        watcher: watcher.read().await.clone(),
        log_size: reader.size().unwrap_or(0),
        log_signature: reader.signature().unwrap_or(0),
    }
}
