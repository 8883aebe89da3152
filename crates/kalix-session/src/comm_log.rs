//! Per-session record of raw wire traffic.
//!
//! Every line sent to or received from the engine lands here, bounded so a
//! chatty simulation cannot grow a session without limit.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDirection {
    /// Written to the engine's stdin.
    Sent,
    /// Read from the engine's stdout.
    Stdout,
    /// Read from the engine's stderr.
    Stderr,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub direction: LogDirection,
    pub line: String,
    pub at: DateTime<Utc>,
}

/// Bounded ring of recent wire traffic for one session.
#[derive(Debug)]
pub struct CommunicationLog {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl CommunicationLog {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    pub fn record(&self, direction: LogDirection, line: impl Into<String>) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            direction,
            line: line.into(),
            at: Utc::now(),
        });
    }

    /// Snapshot of the entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for CommunicationLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
