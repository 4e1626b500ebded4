//! The append-only event log: exclusive writer, offset-preserving reader.
//!
//! Every event enters the pipeline through [`EventWriter::append`]; the
//! byte offset of each line is the ground truth from which canonical IDs
//! are minted, both by the live watcher and by historical reads.

use crate::event::Event;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// File name of the active log inside the data directory.
pub const LOG_FILE_NAME: &str = "events.jsonl";

/// Controls file locking behavior for an [`EventWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Acquire an exclusive advisory lock on the log file.
    /// Prevents other processes from opening a writer on the same file.
    /// This is the default.
    #[default]
    Flock,

    /// No locking. Use when you know only one process appends, or in test
    /// scenarios where multiple writers are intentionally used.
    None,
}

/// Result of a successful append operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct AppendResult {
    /// Byte offset where the event line starts.
    pub start_offset: u64,

    /// Byte offset after the trailing newline — the position where
    /// the next event would begin.
    pub end_offset: u64,
}

/// A complete line read back from the log, with its byte extent.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// The parsed event. Its `id` field is whatever was on disk (normally
    /// absent — IDs are minted from `start_offset`, not persisted).
    pub event: Event,
    /// Byte offset of the first byte of the line.
    pub start_offset: u64,
    /// Byte offset just past the terminating newline.
    pub end_offset: u64,
}

/// Exclusive writer for the append log.
///
/// Owns the append file handle. The only mutations it offers are the two
/// the log format admits: appending one serialized event plus a newline,
/// and whole-stream truncation (rotation).
pub struct EventWriter {
    file: File,
    log_path: PathBuf,
}

impl std::fmt::Debug for EventWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWriter")
            .field("log_path", &self.log_path)
            .finish()
    }
}

impl EventWriter {
    /// Open or create the event log inside `dir` for writing.
    ///
    /// Creates `dir/` and `dir/events.jsonl` if they don't exist. Opens the
    /// log in append mode and acquires an exclusive advisory lock.
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        Self::open_with_lock(dir, LockMode::Flock)
    }

    /// Open or create the event log with an explicit lock mode.
    ///
    /// With [`LockMode::Flock`], acquires an exclusive advisory lock. If
    /// another writer holds it, returns an error immediately (non-blocking).
    pub fn open_with_lock(dir: impl AsRef<Path>, lock: LockMode) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let log_path = dir.join(LOG_FILE_NAME);

        fs::create_dir_all(&dir)?;

        let file = OpenOptions::new().create(true).append(true).open(&log_path)?;

        if lock == LockMode::Flock {
            file.try_lock_exclusive().map_err(|e| {
                io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("another writer holds the lock on {}: {e}", log_path.display()),
                )
            })?;
        }

        Ok(EventWriter { file, log_path })
    }

    /// Append an event to the log.
    ///
    /// Serializes the event as a single JSON line, appends the bytes plus
    /// one terminating newline, and flushes to disk. Returns the byte
    /// extent of the written line.
    pub fn append(&mut self, event: &Event) -> io::Result<AppendResult> {
        let start_offset = self.file.seek(SeekFrom::End(0))?;
        let json = serde_json::to_string(event)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writeln!(self.file, "{json}")?;
        self.file.sync_data()?;
        let end_offset = start_offset + json.len() as u64 + 1; // +1 for '\n'

        Ok(AppendResult {
            start_offset,
            end_offset,
        })
    }

    /// Truncate the log to zero bytes (rotation).
    ///
    /// The watcher observes the shrink on its next change signal and
    /// surfaces it to subscribers as a reset marker.
    pub fn truncate(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Get a cheap, cloneable reader pointing at the same log file.
    pub fn reader(&self) -> EventReader {
        EventReader {
            log_path: self.log_path.clone(),
        }
    }

    /// Returns the path to the log file.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Returns the current size of the log in bytes.
    pub fn size(&self) -> io::Result<u64> {
        Ok(fs::metadata(&self.log_path)?.len())
    }
}

/// Cheap, cloneable reader for the append log.
///
/// Opens fresh file handles per read call. Safe to use concurrently with
/// an [`EventWriter`] — completed lines are immutable, and a partial line
/// at EOF (writer flush mid-line) is detected and skipped.
#[derive(Debug, Clone)]
pub struct EventReader {
    log_path: PathBuf,
}

impl EventReader {
    /// Create a reader for the log inside the given data directory.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        EventReader {
            log_path: dir.as_ref().join(LOG_FILE_NAME),
        }
    }

    /// Returns the path to the log file.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Returns the current size of the log in bytes.
    pub fn size(&self) -> io::Result<u64> {
        Ok(fs::metadata(&self.log_path)?.len())
    }

    /// Identifying signature of the current log contents: the xxh64 hash of
    /// the first complete line, or 0 for an empty (or newline-less) log.
    /// Changes when the file is replaced, which is what callers care about.
    pub fn signature(&self) -> io::Result<u64> {
        let file = match File::open(&self.log_path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        reader.read_until(b'\n', &mut buf)?;
        if buf.last() != Some(&b'\n') {
            return Ok(0);
        }
        Ok(xxhash_rust::xxh64::xxh64(&buf[..buf.len() - 1], 0))
    }

    /// Read complete lines starting at the given byte offset.
    ///
    /// Yields a [`LogRecord`] per parseable line. Blank lines are skipped;
    /// a partial line at EOF ends iteration; an unparseable line yields an
    /// `InvalidData` error item (callers decide whether to skip it).
    pub fn records_from(
        &self,
        offset: u64,
    ) -> io::Result<impl Iterator<Item = io::Result<LogRecord>>> {
        let mut file = File::open(&self.log_path)?;
        file.seek(SeekFrom::Start(offset))?;

        Ok(RecordIter {
            reader: BufReader::new(file),
            pos: offset,
            buf: Vec::new(),
        })
    }

    /// The last `n` parseable events in log order.
    ///
    /// Unparseable lines are skipped silently, matching the live tail.
    pub fn tail(&self, n: usize) -> io::Result<Vec<LogRecord>> {
        let mut records = std::collections::VecDeque::with_capacity(n.min(1024));
        for result in self.records_from(0)? {
            match result {
                Ok(record) => {
                    if records.len() == n {
                        records.pop_front();
                    }
                    records.push_back(record);
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(records.into())
    }

    /// Up to `limit` events with `ts < before_ts`, in log order, taken from
    /// the end of the matching range. The second element reports whether
    /// older matching events exist beyond the returned page.
    pub fn page_before(
        &self,
        before_ts: f64,
        limit: usize,
    ) -> io::Result<(Vec<LogRecord>, bool)> {
        let mut page = std::collections::VecDeque::with_capacity(limit.min(1024));
        let mut truncated = false;
        for result in self.records_from(0)? {
            match result {
                Ok(record) => {
                    if record.event.ts >= before_ts {
                        continue;
                    }
                    if page.len() == limit {
                        page.pop_front();
                        truncated = true;
                    }
                    page.push_back(record);
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => continue,
                Err(e) => return Err(e),
            }
        }
        Ok((page.into(), truncated))
    }
}

struct RecordIter {
    reader: BufReader<File>,
    pos: u64,
    buf: Vec<u8>,
}

impl Iterator for RecordIter {
    type Item = io::Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            let n = match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(n) => n,
                Err(e) => return Some(Err(e)),
            };

            // A line that reaches EOF without its newline is a write in
            // progress — stop here, it will be complete on the next read.
            if self.buf.last() != Some(&b'\n') {
                return None;
            }

            let start_offset = self.pos;
            let end_offset = self.pos + n as u64;
            self.pos = end_offset;

            let line = &self.buf[..n - 1];
            if line.is_empty() {
                continue;
            }

            return match serde_json::from_slice::<Event>(line) {
                Ok(event) => Some(Ok(LogRecord {
                    event,
                    start_offset,
                    end_offset,
                })),
                Err(e) => Some(Err(io::Error::new(io::ErrorKind::InvalidData, e))),
            };
        }
    }
}
