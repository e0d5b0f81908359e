//! Bounded in-memory log of proxied inter-plugin calls.
//!
//! Every routed call also emits a structured tracing event; this ring
//! keeps the most recent entries queryable in-process.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Default ring capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// One proxied call, as attributed by the router.
#[derive(Debug, Clone, Serialize)]
pub struct CallLogEntry {
    /// Caller runtime id.
    pub caller: String,
    /// Provider runtime id the call was proxied to.
    pub provider: String,
    /// Registration that was addressed.
    pub registration_id: String,
    /// Service type.
    pub service_type: String,
    /// Method path below the registration.
    pub method: String,
    /// Downstream HTTP status.
    pub status: u16,
    /// End-to-end proxy duration in milliseconds.
    pub duration_ms: u64,
    /// Completion time.
    pub at: DateTime<Utc>,
}

/// Fixed-capacity ring of recent router calls.
pub struct CallLog {
    entries: Mutex<VecDeque<CallLogEntry>>,
    capacity: usize,
}

impl CallLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn record(&self, entry: CallLogEntry) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Most recent entries, newest last, up to `limit`.
    pub fn recent(&self, limit: usize) -> Vec<CallLogEntry> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for CallLog {
    fn default() -> Self {
        Self::new()
    }
}
