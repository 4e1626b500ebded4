//! The fan-out queue: ordered batching with explicit backpressure.
//!
//! Events admitted here are delivered to every connected session as
//! `{"type":"batch","events":[...]}` envelopes, in admission order, with
//! bounded latency. Loss is always visible: overflow materializes as a
//! single gap marker per episode, never as silence.

use crate::event::{self, Event};
use crate::session::{ClientSession, SendOutcome};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

/// How long the first admission of a batch waits for company.
pub const BATCH_WINDOW: Duration = Duration::from_millis(50);

/// Events per batch before an immediate flush preempts the window.
pub const MAX_BATCH: usize = 100;

/// Queue depth beyond which the oldest events are dropped.
pub const QUEUE_SOFT_CAP: usize = 1000;

/// Window within which a re-admitted canonical ID is treated as a duplicate.
pub const RECENT_WINDOW: Duration = Duration::from_millis(5000);

/// Server-to-client frames never exceed this.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Sliding window for the "recently dropped" stat.
const DROP_STAT_WINDOW: Duration = Duration::from_secs(60);

/// How often the sliding drop list is trimmed.
const DROP_STAT_TRIM: Duration = Duration::from_secs(10);

/// Counters surfaced through the stats probe.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BroadcastStats {
    /// Connected session count.
    pub clients: usize,
    /// Events currently queued.
    pub queue_depth: usize,
    /// Batches flushed since startup.
    pub batches_sent: u64,
    /// Events flushed since startup.
    pub events_sent: u64,
    /// Events dropped by queue overflow since startup.
    pub events_dropped: u64,
    /// Events dropped in the last 60 seconds.
    pub dropped_last_60s: u64,
}

#[derive(Serialize)]
struct BatchEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    events: &'a [Event],
}

/// Serialize a batch into its wire envelope.
pub(crate) fn serialize_envelope(events: &[Event]) -> serde_json::Result<String> {
    serde_json::to_string(&BatchEnvelope {
        kind: "batch",
        events,
    })
}

struct Inner {
    queue: VecDeque<Event>,
    recent: HashMap<String, Instant>,
    last_recent_trim: Instant,
    last_delivered_id: Option<String>,
    clients: HashMap<Uuid, ClientSession>,
    window_timer: Option<tokio::task::AbortHandle>,
    flush_scheduled: bool,
    batches_sent: u64,
    events_sent: u64,
    events_dropped: u64,
    drop_log: VecDeque<(Instant, u64)>,
    last_drop_trim: Instant,
}

/// The process-wide fan-out queue.
///
/// All state lives behind one mutex; enqueue and flush never await while
/// holding it (client sends are non-blocking), so admissions and flushes
/// are strictly serialized, which is what the ordering guarantees rest on.
/// Must be used from within a tokio runtime: flushes run as spawned tasks.
pub struct Broadcaster {
    /// Self-handle for the tasks that scheduling spawns.
    me: Weak<Broadcaster>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Broadcaster")
            .field("queue_depth", &inner.queue.len())
            .field("clients", &inner.clients.len())
            .field("batches_sent", &inner.batches_sent)
            .finish()
    }
}

impl Broadcaster {
    /// Create an empty queue with no subscribers.
    pub fn new() -> Arc<Self> {
        let now = Instant::now();
        Arc::new_cyclic(|me| Broadcaster {
            me: me.clone(),
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                recent: HashMap::new(),
                last_recent_trim: now,
                last_delivered_id: None,
                clients: HashMap::new(),
                window_timer: None,
                flush_scheduled: false,
                batches_sent: 0,
                events_sent: 0,
                events_dropped: 0,
                drop_log: VecDeque::new(),
                last_drop_trim: now,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means a panic elsewhere; the state itself
        // stays coherent for counters and eviction.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new subscriber session. Returns the session ID and the
    /// receiving half of its envelope channel.
    pub fn register(&self) -> (Uuid, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(crate::session::ENVELOPE_CHANNEL_CAP);
        let session = ClientSession::new(tx);
        let id = session.id;
        let mut inner = self.lock();
        inner.clients.insert(id, session);
        if inner.clients.len() > 1 {
            tracing::warn!(
                clients = inner.clients.len(),
                "multiple concurrent subscriber sessions"
            );
        }
        (id, rx)
    }

    /// Release a session and its per-client state.
    pub fn unregister(&self, id: Uuid) {
        if self.lock().clients.remove(&id).is_some() {
            tracing::debug!(session = %id, "subscriber session released");
        }
    }

    /// Number of connected sessions.
    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Admit one event into the queue.
    ///
    /// Applies the recent-ID duplicate window, the soft-cap backpressure
    /// policy, and the leading-edge / max-batch / windowed flush schedule.
    pub fn enqueue(&self, event: Event) {
        let now = Instant::now();
        let mut inner = self.lock();

        // A rotation starts a new generation: offsets restart at zero, so
        // the recent-ID window must not treat their reuse as duplication.
        if event.is_reset_marker() {
            inner.recent.clear();
        }

        if now.duration_since(inner.last_recent_trim) >= RECENT_WINDOW {
            inner
                .recent
                .retain(|_, t| now.duration_since(*t) <= RECENT_WINDOW);
            inner.last_recent_trim = now;
        }

        if let Some(id) = event.id.clone() {
            if let Some(admitted) = inner.recent.get(&id)
                && now.duration_since(*admitted) <= RECENT_WINDOW
            {
                tracing::debug!(id = %id, "event id seen within recent window, dropping");
                return;
            }
            // Outside the window the ID is re-admitted: a legitimate
            // post-rotation reuse of an offset must not be blacklisted.
            inner.recent.insert(id, now);
        }

        let was_empty = inner.queue.is_empty();
        inner.queue.push_back(event);

        if inner.queue.len() > QUEUE_SOFT_CAP {
            self.shed_overflow(&mut inner, now);
        }

        if inner.queue.len() >= MAX_BATCH {
            if let Some(timer) = inner.window_timer.take() {
                timer.abort();
            }
            self.schedule_flush_now(&mut inner);
        } else if was_empty {
            // Leading edge: the first event of an empty queue flushes on
            // the next turn of the scheduler, not after the window.
            self.schedule_flush_now(&mut inner);
        } else if inner.window_timer.is_none() && !inner.flush_scheduled {
            self.start_window_timer(&mut inner);
        }
    }

    /// Drop the oldest events beyond the soft cap and put one gap marker
    /// at the head of the queue to account for them. An unflushed marker
    /// from the same overload episode folds into the new one, so omitted
    /// events are counted exactly once and markers never count themselves.
    fn shed_overflow(&self, inner: &mut Inner, now: Instant) {
        let to_shed = inner.queue.len() - QUEUE_SOFT_CAP;
        let mut dropped = 0u64;
        let mut newest_dropped_id = None;
        for _ in 0..to_shed {
            let Some(victim) = inner.queue.pop_front() else { break };
            if victim.is_gap_marker() {
                dropped += victim
                    .fields
                    .get("dropped_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
            } else {
                dropped += 1;
                if victim.id.is_some() {
                    newest_dropped_id = victim.id;
                }
            }
        }

        let trigger = newest_dropped_id
            .or_else(|| inner.last_delivered_id.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let to_offset = event::id_offset(&trigger).unwrap_or(0);
        let gap = Event::gap_marker(dropped, inner.last_delivered_id.as_deref(), to_offset, &trigger);
        inner.queue.push_front(gap);

        inner.events_dropped += dropped;
        inner.drop_log.push_back((now, dropped));
        if now.duration_since(inner.last_drop_trim) >= DROP_STAT_TRIM {
            inner
                .drop_log
                .retain(|(t, _)| now.duration_since(*t) <= DROP_STAT_WINDOW);
            inner.last_drop_trim = now;
        }
        tracing::warn!(dropped, "queue over soft cap, shed oldest events");
    }

    fn schedule_flush_now(&self, inner: &mut Inner) {
        if inner.flush_scheduled {
            return;
        }
        let Some(this) = self.me.upgrade() else { return };
        inner.flush_scheduled = true;
        tokio::spawn(async move {
            this.flush();
        });
    }

    fn start_window_timer(&self, inner: &mut Inner) {
        let Some(this) = self.me.upgrade() else { return };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(BATCH_WINDOW).await;
            this.flush();
        });
        inner.window_timer = Some(handle.abort_handle());
    }

    /// Flush up to one batch from the head of the queue to every session.
    ///
    /// Runs entirely under the state lock; at most one flush is ever in
    /// progress. If events remain afterwards, the next flush is scheduled
    /// (immediately at the batch ceiling, else after the window).
    pub fn flush(&self) {
        let mut inner = self.lock();
        inner.flush_scheduled = false;
        if let Some(timer) = inner.window_timer.take() {
            timer.abort();
        }
        if inner.queue.is_empty() {
            return;
        }

        let take = inner.queue.len().min(MAX_BATCH);
        let mut batch: Vec<Event> = inner.queue.drain(..take).collect();

        let mut json = match serialize_envelope(&batch) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize batch envelope");
                return;
            }
        };
        // Halve the batch until the envelope fits the frame cap, returning
        // the remainder to the head of the queue.
        while json.len() > MAX_FRAME_BYTES && batch.len() > 1 {
            let keep = batch.len() / 2;
            for e in batch.drain(keep..).rev() {
                inner.queue.push_front(e);
            }
            json = match serialize_envelope(&batch) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize batch envelope");
                    return;
                }
            };
        }

        verify_batch_order(&batch);
        let (watermark_reset, batch_last_id) = batch_watermark(&batch);
        let envelope = Arc::new(json);

        let mut closed = Vec::new();
        for (id, client) in inner.clients.iter_mut() {
            match client.deliver(&batch, &envelope, watermark_reset, batch_last_id.as_deref()) {
                SendOutcome::Sent | SendOutcome::Lagging => {}
                SendOutcome::Closed => closed.push(*id),
            }
        }
        for id in closed {
            inner.clients.remove(&id);
            tracing::info!(session = %id, "send failed, session evicted");
        }

        inner.batches_sent += 1;
        inner.events_sent += batch.len() as u64;
        if watermark_reset || batch_last_id.is_some() {
            inner.last_delivered_id = batch_last_id;
        }

        if !inner.queue.is_empty() {
            if inner.queue.len() >= MAX_BATCH {
                self.schedule_flush_now(&mut inner);
            } else {
                self.start_window_timer(&mut inner);
            }
        }
    }

    /// Close every session and cancel the pending window timer.
    /// No drain is promised on shutdown.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        if let Some(timer) = inner.window_timer.take() {
            timer.abort();
        }
        inner.clients.clear();
    }

    /// Counter snapshot for the stats probe. Tolerates being read while
    /// a flush is in flight elsewhere.
    pub fn stats(&self) -> BroadcastStats {
        let now = Instant::now();
        let mut inner = self.lock();
        if now.duration_since(inner.last_drop_trim) >= DROP_STAT_TRIM {
            inner
                .drop_log
                .retain(|(t, _)| now.duration_since(*t) <= DROP_STAT_WINDOW);
            inner.last_drop_trim = now;
        }
        let dropped_last_60s = inner
            .drop_log
            .iter()
            .filter(|(t, _)| now.duration_since(*t) <= DROP_STAT_WINDOW)
            .map(|(_, n)| n)
            .sum();
        BroadcastStats {
            clients: inner.clients.len(),
            queue_depth: inner.queue.len(),
            batches_sent: inner.batches_sent,
            events_sent: inner.events_sent,
            events_dropped: inner.events_dropped,
            dropped_last_60s,
        }
    }
}

/// Within-batch ordering assertion: IDs strictly ascend by offset, with
/// reset markers restarting the comparison.
fn verify_batch_order(batch: &[Event]) {
    let mut prev: Option<u64> = None;
    for e in batch {
        if e.is_reset_marker() {
            prev = None;
            continue;
        }
        let Some(offset) = e.offset() else { continue };
        if let Some(p) = prev {
            debug_assert!(
                offset > p,
                "batch offsets not strictly ascending: {p} -> {offset}"
            );
            if offset <= p {
                tracing::error!(prev = p, offset, "batch ordering violated");
            }
        }
        prev = Some(offset);
    }
}

/// Watermark carried forward from a batch: whether it contained a reset
/// marker, and the last ID after the final reset (if any).
fn batch_watermark(batch: &[Event]) -> (bool, Option<String>) {
    let mut reset = false;
    let mut last_id = None;
    for e in batch {
        if e.is_reset_marker() {
            reset = true;
            last_id = None;
        } else if e.id.is_some() {
            last_id = e.id.clone();
        }
    }
    (reset, last_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset_event(offset: u64) -> Event {
        let mut e = Event::new(
            crate::event::EventKind::AgentState,
            "s",
            serde_json::Map::new(),
        );
        e.id = Some(event::watcher_id(offset));
        e
    }

    #[test]
    fn batch_watermark_tracks_last_id() {
        let batch = vec![offset_event(0), offset_event(10)];
        let (reset, last) = batch_watermark(&batch);
        assert!(!reset);
        assert_eq!(last.as_deref(), Some("file_watcher:10"));
    }

    #[test]
    fn batch_watermark_resets_on_marker() {
        let batch = vec![offset_event(50), Event::reset_marker(), offset_event(0)];
        let (reset, last) = batch_watermark(&batch);
        assert!(reset);
        assert_eq!(last.as_deref(), Some("file_watcher:0"));
    }

    #[test]
    fn envelope_shape() {
        let json = serialize_envelope(&[offset_event(0)]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "batch");
        assert_eq!(value["events"][0]["id"], "file_watcher:0");
    }
}
