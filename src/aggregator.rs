//! Bounded, throttled log aggregation.
//!
//! Producers append through a cloneable [`AggregatorHandle`]; the text lands
//! in a mutex-guarded pending queue. The single owner of [`LogAggregator`]
//! (the flush loop) moves pending text into the [`LogBuffer`] on each flush.
//! The lock covers the pending queue only and is held just for the
//! append or the take, never while the buffer is trimmed or rendered.
//!
//! A flush happens on the caller's periodic tick, or sooner when an entry
//! arrives more than one interval after the last flush that committed text.
//! In that case `append` wakes the flush loop through
//! [`AggregatorHandle::flush_requested`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::model::LogEntry;

/// Maximum rendered log size, in characters.
pub const MAX_LOG_BUFFER_SIZE: usize = 20_000;

/// Flush tick.
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(500);

struct PendingQueue {
    text: String,
    /// Byte offset of the most recent entry in `text`.
    last_entry: usize,
    last_flush: Instant,
    wake_sent: bool,
}

struct Shared {
    pending: Mutex<PendingQueue>,
    wake: Notify,
    interval: Duration,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingQueue> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Append side of the aggregator. Cheap to clone, safe to use from any task.
#[derive(Clone)]
pub struct AggregatorHandle {
    shared: Arc<Shared>,
}

impl AggregatorHandle {
    /// Queue an entry. Returns `true` when this entry made a flush due, in
    /// which case the flush loop has been woken.
    pub fn append(&self, entry: LogEntry) -> bool {
        self.append_at(entry, Instant::now())
    }

    pub(crate) fn append_at(&self, entry: LogEntry, now: Instant) -> bool {
        if entry.is_empty() {
            return false;
        }
        let due = {
            let mut pending = self.shared.pending();
            pending.last_entry = pending.text.len();
            pending.text.push_str(entry.as_str());

            let due = now.saturating_duration_since(pending.last_flush) > self.shared.interval;
            let wake = due && !pending.wake_sent;
            if wake {
                pending.wake_sent = true;
            }
            wake
        };
        if due {
            self.shared.wake.notify_one();
        }
        due
    }

    /// Resolves when an append made a flush due.
    pub async fn flush_requested(&self) {
        self.shared.wake.notified().await;
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }
}

impl std::fmt::Debug for AggregatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatorHandle")
            .field("interval", &self.shared.interval)
            .finish_non_exhaustive()
    }
}

/// The displayed log, capped at `max_chars` characters.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    text: String,
    max_chars: usize,
}

impl LogBuffer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            text: String::new(),
            max_chars,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Append text, then trim once if over the cap. Returns the number of
    /// bytes trimmed from the front.
    pub fn push(&mut self, text: &str) -> usize {
        self.text.push_str(text);
        self.trim()
    }

    /// Single pass: cut at the first line boundary at or after
    /// `len - max_chars`. When the tail is one unterminated line longer than
    /// that, cut at the last boundary before it instead, which leaves the
    /// buffer over the cap.
    fn trim(&mut self) -> usize {
        let len = self.len();
        if len <= self.max_chars {
            return 0;
        }
        let excess = len - self.max_chars;
        let raw_cut = self
            .text
            .char_indices()
            .nth(excess)
            .map_or(self.text.len(), |(i, _)| i);
        let cut = match self.text[raw_cut..].find('\n') {
            Some(nl) => raw_cut + nl + 1,
            None => self.text[..raw_cut].rfind('\n').map_or(0, |nl| nl + 1),
        };
        if cut == 0 {
            return 0;
        }
        self.text.drain(..cut);
        cut
    }
}

/// Result of a flush that had something to commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flush {
    /// Full buffer after the commit and trim.
    pub text: String,
    /// The most recent entry committed by this flush.
    pub latest: String,
}

/// Owner of the log buffer; see the module docs.
pub struct LogAggregator {
    shared: Arc<Shared>,
    buffer: LogBuffer,
}

impl LogAggregator {
    pub fn new(max_chars: usize, interval: Duration) -> Self {
        Self::new_at(max_chars, interval, Instant::now())
    }

    pub(crate) fn new_at(max_chars: usize, interval: Duration, now: Instant) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingQueue {
                text: String::new(),
                last_entry: 0,
                last_flush: now,
                wake_sent: false,
            }),
            wake: Notify::new(),
            interval,
        });
        Self {
            shared,
            buffer: LogBuffer::new(max_chars),
        }
    }

    pub fn handle(&self) -> AggregatorHandle {
        AggregatorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn append(&self, entry: LogEntry) -> bool {
        self.handle().append(entry)
    }

    /// Commit pending text. `None` when nothing was pending, in which case
    /// the last-flush time is left alone.
    pub fn flush(&mut self) -> Option<Flush> {
        self.flush_at(Instant::now())
    }

    pub(crate) fn flush_at(&mut self, now: Instant) -> Option<Flush> {
        let (pending, last_entry) = {
            let mut queue = self.shared.pending();
            // An empty tick is not a flush; the quiet period keeps running.
            if queue.text.is_empty() {
                return None;
            }
            queue.last_flush = now;
            queue.wake_sent = false;
            let last_entry = std::mem::take(&mut queue.last_entry);
            (std::mem::take(&mut queue.text), last_entry)
        };

        let trimmed = self.buffer.push(&pending);
        if trimmed > 0 {
            log::debug!(
                "Trimmed {} bytes from log buffer ({} chars kept)",
                trimmed,
                self.buffer.len()
            );
        }
        Some(Flush {
            text: self.buffer.as_str().to_string(),
            latest: pending[last_entry..].to_string(),
        })
    }

    pub fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }
}

impl std::fmt::Debug for LogAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogAggregator")
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}
