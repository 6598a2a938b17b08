//! Usage Recorder (C3) and its storage collaborator.
//!
//! The persistent usage database is treated as an external collaborator
//! with only a write-side interface specified; this module supplements
//! that with a minimal in-memory aggregator so `/stats*` return real data
//! without a SQL dependency. Swapping in a real store is a drop-in
//! replacement of `UsageStore`.

use chrono::{DateTime, Timelike, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

/// One append-only usage record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UsageEvent {
    pub key_index: usize,
    pub model: String,
    pub client_ip: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub timestamp_utc: DateTime<Utc>,
    pub path: String,
    pub request_archive_id: Option<String>,
}

/// Write-side interface to the usage store. Implementations must not block
/// or fail the client response on their own errors — `record` returning
/// `Err` is logged at WARN by the caller and otherwise ignored, matching
/// `AccountingFailure`'s non-fatal contract.
pub trait UsageStore: Send + Sync {
    fn record(&self, event: UsageEvent) -> Result<(), String>;

    /// Per-key request count over the last two wall-clock hours, used by
    /// the Selector's load-balance hint. May return an empty map.
    fn recent_usage_hint(&self, now: DateTime<Utc>) -> HashMap<usize, u64>;

    /// Hourly aggregated usage (`GET /stats`).
    fn hourly_summary(&self) -> Vec<HourlyBucket>;

    /// Per-minute buckets for the last `window` (`GET /stats/minute`).
    fn minute_buckets(&self, window: std::time::Duration, now: DateTime<Utc>) -> Vec<MinuteBucket>;

    /// 24-hour summary (`GET /stats/24h`).
    fn last_24h_summary(&self, now: DateTime<Utc>) -> DaySummary;
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HourlyBucket {
    pub hour: DateTime<Utc>,
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MinuteBucket {
    pub minute: DateTime<Utc>,
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, serde::Serialize, Default)]
pub struct DaySummary {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub by_model: HashMap<String, u64>,
}

/// Bounded in-process usage store. Keeps the last `CAPACITY` events and
/// derives all aggregates from that ring — fine for the dashboard's
/// polling cadence, not a substitute for a real indexed-by-timestamp table.
pub struct InMemoryUsageStore {
    events: Mutex<Vec<UsageEvent>>,
}

const CAPACITY: usize = 100_000;

impl Default for InMemoryUsageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        InMemoryUsageStore {
            events: Mutex::new(Vec::new()),
        }
    }
}

impl UsageStore for InMemoryUsageStore {
    fn record(&self, event: UsageEvent) -> Result<(), String> {
        let mut events = self.events.lock();
        if events.len() >= CAPACITY {
            events.remove(0);
        }
        events.push(event);
        Ok(())
    }

    fn recent_usage_hint(&self, now: DateTime<Utc>) -> HashMap<usize, u64> {
        let cutoff = now - chrono::Duration::hours(2);
        let mut hint = HashMap::new();
        for e in self.events.lock().iter() {
            if e.timestamp_utc >= cutoff {
                *hint.entry(e.key_index).or_insert(0) += 1;
            }
        }
        hint
    }

    fn hourly_summary(&self) -> Vec<HourlyBucket> {
        let mut buckets: HashMap<DateTime<Utc>, HourlyBucket> = HashMap::new();
        for e in self.events.lock().iter() {
            let hour = e
                .timestamp_utc
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(e.timestamp_utc);
            let bucket = buckets.entry(hour).or_insert(HourlyBucket {
                hour,
                requests: 0,
                prompt_tokens: 0,
                completion_tokens: 0,
            });
            bucket.requests += 1;
            bucket.prompt_tokens += e.prompt_tokens;
            bucket.completion_tokens += e.completion_tokens;
        }
        let mut out: Vec<_> = buckets.into_values().collect();
        out.sort_by_key(|b| b.hour);
        out
    }

    fn minute_buckets(&self, window: std::time::Duration, now: DateTime<Utc>) -> Vec<MinuteBucket> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::hours(1));
        let cutoff = now - window;
        let mut buckets: HashMap<DateTime<Utc>, MinuteBucket> = HashMap::new();
        for e in self.events.lock().iter() {
            if e.timestamp_utc < cutoff {
                continue;
            }
            let minute = e
                .timestamp_utc
                .with_second(0)
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(e.timestamp_utc);
            let bucket = buckets.entry(minute).or_insert(MinuteBucket {
                minute,
                requests: 0,
                prompt_tokens: 0,
                completion_tokens: 0,
            });
            bucket.requests += 1;
            bucket.prompt_tokens += e.prompt_tokens;
            bucket.completion_tokens += e.completion_tokens;
        }
        let mut out: Vec<_> = buckets.into_values().collect();
        out.sort_by_key(|b| b.minute);
        out
    }

    fn last_24h_summary(&self, now: DateTime<Utc>) -> DaySummary {
        let cutoff = now - chrono::Duration::hours(24);
        let mut summary = DaySummary::default();
        for e in self.events.lock().iter() {
            if e.timestamp_utc < cutoff {
                continue;
            }
            summary.requests += 1;
            summary.prompt_tokens += e.prompt_tokens;
            summary.completion_tokens += e.completion_tokens;
            *summary.by_model.entry(e.model.clone()).or_insert(0) += 1;
        }
        summary
    }
}

/// Parse a `?window=` query value into a `Duration`, from the enumerated
/// set of accepted window names.
pub fn parse_window(raw: &str) -> Option<std::time::Duration> {
    use std::time::Duration;
    match raw {
        "10m" => Some(Duration::from_secs(10 * 60)),
        "60m" => Some(Duration::from_secs(60 * 60)),
        "2h" => Some(Duration::from_secs(2 * 60 * 60)),
        "4h" => Some(Duration::from_secs(4 * 60 * 60)),
        "6h" => Some(Duration::from_secs(6 * 60 * 60)),
        "12h" => Some(Duration::from_secs(12 * 60 * 60)),
        "24h" => Some(Duration::from_secs(24 * 60 * 60)),
        _ => None,
    }
}

/// Archive collaborator seam: persists the raw request body as a
/// compressed blob, identified by the returned id. Archive write failure
/// must never block or fail the usage event — callers should log and
/// continue on `Err`.
pub trait ArchiveSink: Send + Sync {
    fn archive(&self, body: &[u8]) -> Result<String, String>;
}

/// Default no-op archive: archiving is out of scope here, but the seam is
/// real so a gzip-to-disk implementation is a drop-in replacement.
pub struct NoopArchiveSink;

impl ArchiveSink for NoopArchiveSink {
    fn archive(&self, _body: &[u8]) -> Result<String, String> {
        Err("archive sink not configured".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(key_index: usize, ts: DateTime<Utc>) -> UsageEvent {
        UsageEvent {
            key_index,
            model: "llama3".into(),
            client_ip: "127.0.0.1".into(),
            prompt_tokens: 3,
            completion_tokens: 12,
            timestamp_utc: ts,
            path: "/v1/chat/completions".into(),
            request_archive_id: None,
        }
    }

    #[test]
    fn recent_usage_hint_excludes_old_events() {
        let store = InMemoryUsageStore::new();
        let now = Utc::now();
        store.record(event(0, now - chrono::Duration::hours(3))).unwrap();
        store.record(event(0, now - chrono::Duration::minutes(5))).unwrap();
        let hint = store.recent_usage_hint(now);
        assert_eq!(hint.get(&0), Some(&1));
    }

    #[test]
    fn last_24h_summary_counts_requests_and_tokens() {
        let store = InMemoryUsageStore::new();
        let now = Utc::now();
        store.record(event(0, now)).unwrap();
        store.record(event(1, now)).unwrap();
        let summary = store.last_24h_summary(now);
        assert_eq!(summary.requests, 2);
        assert_eq!(summary.prompt_tokens, 6);
        assert_eq!(summary.completion_tokens, 24);
    }

    #[test]
    fn parse_window_accepts_enumerated_values_only() {
        assert!(parse_window("10m").is_some());
        assert!(parse_window("24h").is_some());
        assert!(parse_window("nope").is_none());
    }
}
