//! Asynchronous log queue.
//!
//! Producers and the consumer thread must never perform synchronous console
//! I/O, so every log line goes through this bounded ring instead. Any thread
//! may `enqueue`; a single flusher (the embedding main loop) drains in
//! small, time-bounded batches. When the ring is full the oldest entry is
//! replaced — the most recent context is the most diagnostically valuable —
//! and the replacement is counted.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Maximum stored length of one formatted log line, in bytes.
pub const MAX_LOG_LINE: usize = 256;

/// Default queue depth.
const DEFAULT_CAPACITY: usize = 10_000;

/// Severity of a queued log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
}

impl Level {
    /// Fixed-width tag used by sinks.
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
        }
    }
}

/// One formatted line, truncated to [`MAX_LOG_LINE`] bytes.
#[derive(Clone, Copy, Debug)]
struct Entry {
    level: Level,
    seq: u64,
    len: u16,
    bytes: [u8; MAX_LOG_LINE],
}

impl Entry {
    fn new(level: Level, seq: u64, text: &str) -> Self {
        // Truncate on a char boundary so the stored bytes stay valid UTF-8.
        let mut len = text.len().min(MAX_LOG_LINE);
        while !text.is_char_boundary(len) {
            len -= 1;
        }
        let mut bytes = [0u8; MAX_LOG_LINE];
        bytes[..len].copy_from_slice(&text.as_bytes()[..len]);
        Self {
            level,
            seq,
            len: len as u16,
            bytes,
        }
    }

    fn text(&self) -> &str {
        // Entries are only constructed from `&str` prefixes cut on char
        // boundaries, so this cannot fail.
        std::str::from_utf8(&self.bytes[..usize::from(self.len)]).unwrap_or("")
    }
}

/// Destination for flushed log lines.
///
/// `flush` never holds the queue lock across a sink call, so a slow sink
/// delays flushing but never blocks an enqueueing thread.
pub trait LogSink {
    fn write_line(&mut self, level: Level, line: &str) -> io::Result<()>;
}

/// Writes lines to stdout, one per call.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&mut self, level: Level, line: &str) -> io::Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        writeln!(out, "[{}] {}", level.as_str(), line)
    }
}

/// Collects lines in memory; for tests and embedders that render logs.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub lines: Vec<(Level, String)>,
}

impl LogSink for MemorySink {
    fn write_line(&mut self, level: Level, line: &str) -> io::Result<()> {
        self.lines.push((level, line.to_owned()));
        Ok(())
    }
}

/// Bounded multi-producer log ring with a single flushing reader.
#[derive(Debug)]
pub struct LogQueue {
    ring: Mutex<VecDeque<Entry>>,
    capacity: usize,
    next_seq: AtomicU64,
    dropped: AtomicU64,
}

impl LogQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "log queue capacity must be non-zero");
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            next_seq: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Queues one line, truncating to [`MAX_LOG_LINE`] bytes.
    ///
    /// Non-blocking apart from a short mutex hold; when the ring is full the
    /// oldest entry is replaced and the drop counter incremented.
    pub fn enqueue(&self, level: Level, text: &str) {
        let seq = self.next_seq.fetch_add(1, Relaxed);
        let entry = Entry::new(level, seq, text);
        let mut ring = self.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
            self.dropped.fetch_add(1, Relaxed);
        }
        ring.push_back(entry);
    }

    /// Drains up to `max_entries` lines or until `max_wall_us` elapses,
    /// whichever comes first, writing each to `sink`. Returns the number of
    /// lines written.
    ///
    /// An entry is copied out and written with the lock released; it is
    /// popped only if it is still at the front afterwards, so a sink error
    /// leaves it queued for the next call.
    pub fn flush(&self, max_entries: usize, max_wall_us: u64, sink: &mut dyn LogSink) -> usize {
        let deadline = Instant::now() + Duration::from_micros(max_wall_us);
        let mut drained = 0;

        while drained < max_entries {
            let entry = match self.lock().front() {
                Some(e) => *e,
                None => break,
            };

            if sink.write_line(entry.level, entry.text()).is_err() {
                break;
            }

            let mut ring = self.lock();
            if ring.front().is_some_and(|e| e.seq == entry.seq) {
                ring.pop_front();
            }
            drop(ring);
            drained += 1;

            if Instant::now() >= deadline {
                break;
            }
        }

        drained
    }

    /// Current queue depth.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Entries overwritten because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Entry>> {
        // A poisoned ring still holds well-formed entries; keep logging.
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LogQueue {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
