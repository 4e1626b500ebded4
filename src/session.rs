//! Per-client session state for the fan-out queue.

use crate::event::{self, Event};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Capacity of a session's envelope channel, in batches. At the maximum
/// batch size this bounds a slow client's backlog to the fan-out queue's
/// soft cap worth of events.
pub const ENVELOPE_CHANNEL_CAP: usize = 10;

/// Outcome of delivering one batch to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    /// The envelope was queued for the client.
    Sent,
    /// The client's channel is full; the batch was skipped and recorded
    /// in the session's lag ledger.
    Lagging,
    /// The client is gone; the session must be released.
    Closed,
}

/// A connected subscriber: its envelope channel plus the per-client state
/// the fan-out queue needs for ordering checks and lag accounting.
pub struct ClientSession {
    /// Unique session identifier, for diagnostics.
    pub id: Uuid,
    sender: mpsc::Sender<Arc<String>>,
    /// ID of the last event in the previous batch delivered to this client.
    last_batch_last_id: Option<String>,
    /// Events skipped while the client's channel was full.
    pending_dropped: u64,
    /// ID of the newest skipped event.
    pending_to_id: Option<String>,
    connected_at: Instant,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("last_batch_last_id", &self.last_batch_last_id)
            .field("pending_dropped", &self.pending_dropped)
            .field("channel_closed", &self.sender.is_closed())
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

impl ClientSession {
    pub(crate) fn new(sender: mpsc::Sender<Arc<String>>) -> Self {
        ClientSession {
            id: Uuid::new_v4(),
            sender,
            last_batch_last_id: None,
            pending_dropped: 0,
            pending_to_id: None,
            connected_at: Instant::now(),
        }
    }

    /// Deliver one batch. `watermark_reset` is true when the batch carries
    /// a reset marker (ordering restarts); `batch_last_id` is the ID the
    /// cross-batch check uses for the batch that follows this one.
    pub(crate) fn deliver(
        &mut self,
        batch: &[Event],
        envelope: &Arc<String>,
        watermark_reset: bool,
        batch_last_id: Option<&str>,
    ) -> SendOutcome {
        self.check_batch_order(batch, watermark_reset);

        let payload = if self.pending_dropped > 0 {
            // The client missed batches while its channel was full; the
            // resuming batch carries exactly one gap marker up front.
            let trigger = self.pending_to_id.as_deref().unwrap_or("unknown");
            let to_offset = event::id_offset(trigger).unwrap_or(0);
            let gap = Event::gap_marker(
                self.pending_dropped,
                self.last_batch_last_id.as_deref(),
                to_offset,
                trigger,
            );
            let mut events = Vec::with_capacity(batch.len() + 1);
            events.push(gap);
            events.extend_from_slice(batch);
            match crate::broadcast::serialize_envelope(&events) {
                Ok(json) => Arc::new(json),
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize gap envelope");
                    envelope.clone()
                }
            }
        } else {
            envelope.clone()
        };

        match self.sender.try_send(payload) {
            Ok(()) => {
                self.pending_dropped = 0;
                self.pending_to_id = None;
                if watermark_reset {
                    self.last_batch_last_id = batch_last_id.map(str::to_string);
                } else if let Some(last) = batch_last_id {
                    self.last_batch_last_id = Some(last.to_string());
                }
                SendOutcome::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                // A missed gap marker stands for events that were already
                // dropped once; fold its count in rather than counting it.
                let missed: u64 = batch
                    .iter()
                    .map(|e| {
                        if e.is_gap_marker() {
                            e.fields
                                .get("dropped_count")
                                .and_then(Value::as_u64)
                                .unwrap_or(1)
                        } else {
                            1
                        }
                    })
                    .sum();
                self.pending_dropped += missed;
                if let Some(last) = batch_last_id {
                    self.pending_to_id = Some(last.to_string());
                }
                tracing::debug!(
                    session = %self.id,
                    missed = self.pending_dropped,
                    "client lagging, batch skipped"
                );
                SendOutcome::Lagging
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Cross-batch ordering check: the first ID of a new batch must sort
    /// beyond the last ID of the previous batch delivered to this client.
    /// Gap markers derive their offset from dropped (undelivered) events,
    /// so they satisfy the same rule; a reset marker restarts it.
    fn check_batch_order(&self, batch: &[Event], watermark_reset: bool) {
        if watermark_reset || self.pending_dropped > 0 {
            return;
        }
        let (Some(prev), Some(first)) = (
            self.last_batch_last_id.as_deref().and_then(event::id_offset),
            batch.iter().find_map(Event::offset),
        ) else {
            return;
        };
        debug_assert!(
            first > prev,
            "batch first offset {first} not beyond previous batch last {prev}"
        );
        if first <= prev {
            tracing::error!(
                session = %self.id,
                first,
                prev,
                "cross-batch ordering violated"
            );
        }
    }
}
