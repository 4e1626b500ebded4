//! The tailing watcher: the single source of canonical IDs.
//!
//! [`TailState`] is the synchronous framing core: it owns the byte-offset
//! bookkeeping, the carry buffer for lines split across reads, and the
//! per-generation `seen` set. [`spawn_watcher`] wraps it in an async shell
//! that reacts to file-change notifications with a single-flight read
//! discipline, detects rotation, and recovers from I/O errors.

use crate::broadcast::Broadcaster;
use crate::event::{self, Event};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, watch};

/// Cap on the per-generation `seen` set; oldest offsets are evicted first.
const SEEN_CAP: usize = 10_000;

/// Consecutive I/O failures tolerated before a full state reset.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Pause before reinitializing after the error threshold is hit.
const REINIT_DELAY: Duration = Duration::from_millis(1000);

/// Poll cadence while waiting for the log file to first appear.
const INIT_POLL: Duration = Duration::from_millis(250);

/// Fallback poll cadence; inotify can miss events in some setups.
const POLL_FALLBACK: Duration = Duration::from_millis(1000);

static WATCHER_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Per-generation set of emitted line-start offsets, bounded in size.
#[derive(Debug, Default)]
struct SeenSet {
    set: HashSet<u64>,
    order: VecDeque<u64>,
}

impl SeenSet {
    fn contains(&self, offset: u64) -> bool {
        self.set.contains(&offset)
    }

    fn insert(&mut self, offset: u64) {
        if self.set.insert(offset) {
            self.order.push_back(offset);
            while self.set.len() > SEEN_CAP {
                match self.order.pop_front() {
                    Some(old) => {
                        self.set.remove(&old);
                    }
                    None => break,
                }
            }
        }
    }

    // Removal leaves a stale entry in `order`; eviction skips over it.
    fn remove(&mut self, offset: u64) {
        self.set.remove(&offset);
    }

    fn len(&self) -> usize {
        self.set.len()
    }

    fn clear(&mut self) {
        self.set.clear();
        self.order.clear();
    }
}

/// The watcher's exclusively-owned framing state.
///
/// Feed raw chunks from the log in file order via [`TailState::absorb`];
/// complete newline-terminated lines come back as events carrying their
/// canonical `file_watcher:<offset>` IDs, exactly once per generation.
#[derive(Debug, Default)]
pub struct TailState {
    last_offset: u64,
    carry: Vec<u8>,
    last_emitted_offset: Option<u64>,
    seen: SeenSet,
}

impl TailState {
    /// Fresh state that considers everything before `offset` already
    /// consumed. Used at startup so only new events are streamed.
    pub fn starting_at(offset: u64) -> Self {
        TailState {
            last_offset: offset,
            ..TailState::default()
        }
    }

    /// Byte position after the last complete line consumed.
    pub fn offset(&self) -> u64 {
        self.last_offset
    }

    /// File position the next read should start from.
    pub fn read_position(&self) -> u64 {
        self.last_offset + self.carry.len() as u64
    }

    /// Bytes held over from a line split across reads.
    pub fn carry_len(&self) -> usize {
        self.carry.len()
    }

    /// Size of the per-generation duplicate-suppression set.
    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    /// Full reset: new generation. Offsets to zero, carry and seen cleared.
    pub fn reset(&mut self) {
        self.last_offset = 0;
        self.carry.clear();
        self.last_emitted_offset = None;
        self.seen.clear();
    }

    /// Transient-error rewind: next attempt re-reads from the head of the
    /// file. Intentionally lossy for a locked-or-missing file, because the
    /// log itself is the truth. The `seen` set survives, so offsets already
    /// emitted this generation are not emitted again.
    pub fn rewind(&mut self) {
        self.last_offset = 0;
        self.carry.clear();
    }

    /// Frame a chunk of bytes read from [`TailState::read_position`].
    ///
    /// Scans for complete lines, skips blanks and duplicates, drops
    /// unparseable lines, attaches canonical IDs, and returns the emitted
    /// events in ascending ID order. Leftover bytes become the new carry.
    pub fn absorb(&mut self, chunk: &[u8]) -> Vec<Event> {
        debug_assert!(
            !self.carry.contains(&b'\n'),
            "carry must never contain a newline"
        );

        // carry[0] sits at file offset `last_offset`.
        let base = self.last_offset;
        self.carry.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut line_start = 0usize;

        for i in 0..self.carry.len() {
            if self.carry[i] != b'\n' {
                continue;
            }
            let line = &self.carry[line_start..i];
            let start_offset = base + line_start as u64;
            line_start = i + 1;

            // Blank lines are not permitted in the format; skip defensively.
            if line.is_empty() {
                continue;
            }

            if self.seen.contains(start_offset) {
                tracing::debug!(offset = start_offset, "duplicate line offset, skipping");
                continue;
            }
            // Mark before parsing; unmark on failure so a corrected line
            // at this offset can be re-ingested.
            self.seen.insert(start_offset);

            let mut parsed: Event = match serde_json::from_slice(line) {
                Ok(event) => event,
                Err(e) => {
                    self.seen.remove(start_offset);
                    tracing::debug!(offset = start_offset, error = %e, "unparseable line dropped");
                    continue;
                }
            };
            parsed.id = Some(event::watcher_id(start_offset));

            if let Some(prev) = self.last_emitted_offset {
                debug_assert!(
                    start_offset > prev,
                    "emitted offset {start_offset} not beyond {prev}"
                );
                if start_offset <= prev {
                    tracing::error!(
                        offset = start_offset,
                        prev,
                        "emission order violated, resetting watcher state"
                    );
                    self.reset();
                    return events;
                }
            }
            self.last_emitted_offset = Some(start_offset);
            events.push(parsed);
        }

        self.carry.drain(..line_start);
        self.last_offset = base + line_start as u64;
        debug_assert!(
            !self.carry.contains(&b'\n'),
            "carry must never contain a newline"
        );

        events
    }
}

/// Live watcher state surfaced through the stats probe.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WatcherStatus {
    /// Byte position after the last complete line consumed.
    pub offset: u64,
    /// Bytes currently held in the carry buffer.
    pub carry_len: usize,
    /// Size of the duplicate-suppression set.
    pub seen_len: usize,
    /// Transient-error counter.
    pub consecutive_errors: u32,
}

/// Handle to a running watcher task.
///
/// Dropping the handle aborts the task and releases the process-wide
/// watcher slot; [`WatcherHandle::shutdown`] stops it cleanly.
#[derive(Debug)]
pub struct WatcherHandle {
    status: Arc<RwLock<WatcherStatus>>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl WatcherHandle {
    /// Snapshot of the watcher's current state.
    pub async fn status(&self) -> WatcherStatus {
        self.status.read().await.clone()
    }

    /// Shared view of the watcher's state, for the stats probe.
    pub fn status_cell(&self) -> Arc<RwLock<WatcherStatus>> {
        self.status.clone()
    }

    /// Signal the task to stop and wait for it to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        let _ = (&mut self.task).await;
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
        WATCHER_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Spawn the tailing watcher for `log_path`, broadcasting through
/// `broadcaster`.
///
/// Exactly one watcher may run per process; it exclusively owns the
/// offset state that canonical IDs are minted from. A second call while
/// one is live is refused.
pub fn spawn_watcher(
    log_path: impl Into<PathBuf>,
    broadcaster: Arc<Broadcaster>,
) -> io::Result<WatcherHandle> {
    if WATCHER_ACTIVE.swap(true, Ordering::SeqCst) {
        tracing::error!("refusing to start a second log watcher in this process");
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "log watcher already running in this process",
        ));
    }

    let status = Arc::new(RwLock::new(WatcherStatus::default()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(run_watcher(
        log_path.into(),
        broadcaster,
        status.clone(),
        shutdown_rx,
    ));

    Ok(WatcherHandle {
        status,
        shutdown: shutdown_tx,
        task,
    })
}

struct WatcherTask {
    path: PathBuf,
    broadcaster: Arc<Broadcaster>,
    status: Arc<RwLock<WatcherStatus>>,
    tail: TailState,
    consecutive_errors: u32,
    reading: bool,
    dirty: bool,
}

async fn run_watcher(
    path: PathBuf,
    broadcaster: Arc<Broadcaster>,
    status: Arc<RwLock<WatcherStatus>>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Wait for the log to exist, then tail from EOF: replaying the entire
    // history to live subscribers on every restart is explicitly not the
    // contract.
    let initial_size = loop {
        match fs::metadata(&path) {
            Ok(meta) => break meta.len(),
            Err(_) => {
                tokio::select! {
                    _ = tokio::time::sleep(INIT_POLL) => {}
                    _ = shutdown.changed() => if *shutdown.borrow() { return },
                }
            }
        }
    };

    let mut task = WatcherTask {
        path: path.clone(),
        broadcaster,
        status,
        tail: TailState::starting_at(initial_size),
        consecutive_errors: 0,
        reading: false,
        dirty: false,
    };
    task.publish_status().await;

    // File-change notifications, bridged onto the task's channel. If the
    // OS watcher cannot be created the poll fallback still drives reads.
    // The keepalive sender stops `recv` from resolving to `None` in that
    // case.
    let (notify_tx, mut notify_rx) = mpsc::channel::<()>(16);
    let _notify_keepalive = notify_tx.clone();
    let _fs_watcher = match create_fs_watcher(&path, notify_tx) {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!(error = %e, "file notifications unavailable, polling only");
            None
        }
    };

    loop {
        tokio::select! {
            sig = notify_rx.recv() => {
                if sig.is_some() {
                    task.on_signal(&mut notify_rx).await;
                }
            }
            _ = tokio::time::sleep(POLL_FALLBACK) => {
                let size = fs::metadata(&task.path).map(|m| m.len());
                if size.map_or(false, |s| s != task.tail.read_position()) {
                    task.on_signal(&mut notify_rx).await;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::debug!("log watcher shutting down");
                    return;
                }
            }
        }
    }
}

impl WatcherTask {
    /// Single-flight discipline: one read in flight at a time; a signal
    /// arriving mid-read marks the state dirty and the read runs once more
    /// after completion.
    async fn on_signal(&mut self, rx: &mut mpsc::Receiver<()>) {
        if self.reading {
            self.dirty = true;
            return;
        }
        self.reading = true;
        loop {
            self.read_new_events().await;
            while rx.try_recv().is_ok() {
                self.dirty = true;
            }
            if self.dirty {
                self.dirty = false;
                continue;
            }
            break;
        }
        self.reading = false;
    }

    async fn read_new_events(&mut self) {
        let path = self.path.clone();
        let size = match blocking_io(move || Ok(fs::metadata(&path)?.len())).await {
            Ok(size) => size,
            Err(e) => {
                self.on_error(e).await;
                return;
            }
        };

        if size < self.tail.offset() {
            tracing::info!(
                size,
                offset = self.tail.offset(),
                "log truncated or rotated, starting new generation"
            );
            self.tail.reset();
            self.broadcaster.enqueue(Event::reset_marker());
        }

        let read_from = self.tail.read_position();
        if size > read_from {
            let path = self.path.clone();
            let chunk = blocking_io(move || {
                let mut file = fs::File::open(&path)?;
                file.seek(SeekFrom::Start(read_from))?;
                let mut buf = Vec::new();
                file.read_to_end(&mut buf)?;
                Ok(buf)
            })
            .await;

            match chunk {
                Ok(bytes) => {
                    for event in self.tail.absorb(&bytes) {
                        self.broadcaster.enqueue(event);
                    }
                }
                Err(e) => {
                    self.on_error(e).await;
                    return;
                }
            }
        }

        self.consecutive_errors = 0;
        self.publish_status().await;
    }

    async fn on_error(&mut self, e: io::Error) {
        self.consecutive_errors += 1;
        if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
            tracing::warn!(
                error = %e,
                failures = self.consecutive_errors,
                "error threshold reached, reinitializing watcher state"
            );
            self.tail.reset();
            self.consecutive_errors = 0;
            self.publish_status().await;
            tokio::time::sleep(REINIT_DELAY).await;
        } else {
            tracing::debug!(error = %e, failures = self.consecutive_errors, "watcher read failed");
            self.tail.rewind();
            self.publish_status().await;
        }
    }

    async fn publish_status(&self) {
        let mut status = self.status.write().await;
        *status = WatcherStatus {
            offset: self.tail.offset(),
            carry_len: self.tail.carry_len(),
            seen_len: self.tail.seen_len(),
            consecutive_errors: self.consecutive_errors,
        };
    }
}

async fn blocking_io<T, F>(f: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| io::Error::other(e))?
}

fn create_fs_watcher(
    log_path: &Path,
    tx: mpsc::Sender<()>,
) -> io::Result<notify::RecommendedWatcher> {
    use notify::{EventKind, RecursiveMode, Watcher};

    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res
                && matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
            {
                let _ = tx.try_send(());
            }
        })
        .map_err(io::Error::other)?;

    // Watch the parent directory: the file may be replaced wholesale
    // during rotation, which retires its inode.
    watcher
        .watch(
            log_path.parent().unwrap_or(log_path),
            RecursiveMode::NonRecursive,
        )
        .map_err(io::Error::other)?;

    Ok(watcher)
}
