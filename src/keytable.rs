//! The Key Table (C1) — authoritative in-memory state for each upstream
//! credential. One lock per record, following the same per-record
//! `parking_lot::Mutex` discipline the source crate uses for its shared
//! engine state (`engine/state.rs`): table-wide reads copy out under a
//! short critical section rather than holding a single lock across the
//! whole table for the duration of a request.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;

/// One configured upstream credential. Identity is the index into
/// `KeyTable::records`, assigned at load time in configuration order.
pub struct KeyRecord {
    /// Never logged, never serialized into any response.
    secret: String,
    state: Mutex<KeyState>,
}

/// The mutable fields of a key record. Invariant: `available == false` iff
/// `penalty_until` is set and in the future.
#[derive(Debug, Clone, Default)]
pub struct KeyState {
    pub available: bool,
    pub penalty_until: Option<DateTime<Utc>>,
    pub backoff_level: u8,
    pub last_error_status: Option<u16>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub next_probe_at: Option<DateTime<Utc>>,
}

impl KeyState {
    fn fresh() -> Self {
        KeyState {
            available: true,
            ..Default::default()
        }
    }

    /// Recompute `available` from `penalty_until` against `now`. Call this
    /// any time `penalty_until` changes so the two fields never go out of
    /// sync (invariant I1).
    fn recompute_available(&mut self, now: DateTime<Utc>) {
        self.available = match self.penalty_until {
            Some(until) => until <= now,
            None => true,
        };
    }
}

/// A consistent snapshot of one key's public state, safe to hand to the
/// dashboard or the selector. Never contains the secret.
#[derive(Debug, Clone)]
pub struct KeySnapshot {
    pub index: usize,
    pub available: bool,
    pub penalty_until: Option<DateTime<Utc>>,
    pub backoff_level: u8,
    pub last_error_status: Option<u16>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub next_probe_at: Option<DateTime<Utc>>,
}

pub struct KeyTable {
    records: Vec<KeyRecord>,
}

impl KeyTable {
    pub fn new(secrets: Vec<String>) -> Self {
        let records = secrets
            .into_iter()
            .map(|secret| KeyRecord {
                secret,
                state: Mutex::new(KeyState::fresh()),
            })
            .collect();
        KeyTable { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The bearer value for `index`. Callers must not log this.
    pub fn secret(&self, index: usize) -> &str {
        &self.records[index].secret
    }

    /// A consistent read of one record.
    pub fn snapshot_one(&self, index: usize) -> KeySnapshot {
        let s = self.records[index].state.lock().clone();
        KeySnapshot {
            index,
            available: s.available,
            penalty_until: s.penalty_until,
            backoff_level: s.backoff_level,
            last_error_status: s.last_error_status,
            last_error_at: s.last_error_at,
            next_probe_at: s.next_probe_at,
        }
    }

    /// A consistent read of all records (copy out).
    pub fn snapshot(&self) -> Vec<KeySnapshot> {
        (0..self.records.len()).map(|i| self.snapshot_one(i)).collect()
    }

    /// Atomically mutate one record's state under its own lock.
    pub fn update(&self, index: usize, mutate: impl FnOnce(&mut KeyState, DateTime<Utc>)) {
        let now = Utc::now();
        let mut s = self.records[index].state.lock();
        mutate(&mut s, now);
        s.recompute_available(now);
    }

    /// Operator action: clear penalty, backoff level, and last-error fields.
    /// Idempotent — applying twice equals applying once.
    pub fn reset(&self, index: usize) {
        self.update(index, |s, _now| {
            s.penalty_until = None;
            s.backoff_level = 0;
            s.last_error_status = None;
            s.last_error_at = None;
            s.next_probe_at = None;
        });
    }

    /// Indices where `available` is true and not in `exclude`.
    pub fn eligible_indices(&self, exclude: &HashSet<usize>) -> Vec<usize> {
        let now = Utc::now();
        (0..self.records.len())
            .filter(|&i| {
                if exclude.contains(&i) {
                    return false;
                }
                let mut s = self.records[i].state.lock();
                s.recompute_available(now);
                s.available
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_keys_are_available() {
        let table = KeyTable::new(vec!["a".into(), "b".into()]);
        let snap = table.snapshot();
        assert!(snap.iter().all(|k| k.available));
    }

    #[test]
    fn penalize_clears_availability() {
        let table = KeyTable::new(vec!["a".into()]);
        table.update(0, |s, now| {
            s.penalty_until = Some(now + chrono::Duration::minutes(15));
            s.backoff_level = 1;
        });
        let snap = table.snapshot_one(0);
        assert!(!snap.available);
        assert_eq!(snap.backoff_level, 1);
    }

    #[test]
    fn eligible_indices_excludes_penalized_and_excluded() {
        let table = KeyTable::new(vec!["a".into(), "b".into(), "c".into()]);
        table.update(1, |s, now| {
            s.penalty_until = Some(now + chrono::Duration::hours(1));
        });
        let mut exclude = HashSet::new();
        exclude.insert(2usize);
        let elig = table.eligible_indices(&exclude);
        assert_eq!(elig, vec![0]);
    }

    #[test]
    fn reset_is_idempotent() {
        let table = KeyTable::new(vec!["a".into()]);
        table.update(0, |s, now| {
            s.penalty_until = Some(now + chrono::Duration::hours(1));
            s.backoff_level = 3;
        });
        table.reset(0);
        let once = table.snapshot_one(0);
        table.reset(0);
        let twice = table.snapshot_one(0);
        assert!(once.available && twice.available);
        assert_eq!(once.backoff_level, twice.backoff_level);
        assert_eq!(once.penalty_until, twice.penalty_until);
    }

    #[test]
    fn expired_penalty_recomputes_available_on_read() {
        let table = KeyTable::new(vec!["a".into()]);
        table.update(0, |s, now| {
            s.penalty_until = Some(now - chrono::Duration::seconds(1));
        });
        let snap = table.snapshot_one(0);
        assert!(snap.available);
    }
}
