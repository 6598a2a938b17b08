//! In-memory request log ring buffer backing `GET /logs`.
//!
//! Same fixed-capacity overwrite-oldest ring the source crate uses for its
//! `RequestAuditLog` (`engine/http.rs`), minus the request-body hashing that
//! log's write-ahead design needed — this ring exists for operator
//! visibility, not for replay/audit.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

const CAPACITY: usize = 1000;

#[derive(Debug, Clone, serde::Serialize)]
pub struct LogEntry {
    pub request_id: String,
    pub timestamp_utc: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub key_index: Option<usize>,
    pub status: u16,
    pub duration_ms: u64,
    pub client_ip: String,
}

pub struct LogRingBuffer {
    entries: Mutex<Vec<LogEntry>>,
    head: Mutex<usize>,
}

impl Default for LogRingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogRingBuffer {
    pub fn new() -> Self {
        LogRingBuffer {
            entries: Mutex::new(Vec::with_capacity(CAPACITY)),
            head: Mutex::new(0),
        }
    }

    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.lock();
        let mut head = self.head.lock();
        if entries.len() < CAPACITY {
            entries.push(entry);
        } else {
            entries[*head] = entry;
        }
        *head = (*head + 1) % CAPACITY;
    }

    /// Most recent entries first, capped at `limit`.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        let head = *self.head.lock();
        let len = entries.len();
        if len == 0 {
            return Vec::new();
        }
        let count = limit.min(len);
        let mut out = Vec::with_capacity(count);
        let mut idx = if len < CAPACITY { len - 1 } else { (head + CAPACITY - 1) % CAPACITY };
        for _ in 0..count {
            out.push(entries[idx].clone());
            idx = (idx + CAPACITY - 1) % CAPACITY;
        }
        out
    }
}
