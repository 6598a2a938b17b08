//! Health Controller (C6) — background rehabilitation of penalized keys,
//! plus the on-demand snapshot the dashboard polls.
//!
//! Runs as one long-lived task, the same one-task-per-background-concern
//! shape the source crate uses for its cron heartbeat in `lib.rs::run`
//! (`tokio::spawn` + `loop { tick(); sleep(period) }`).

use crate::keytable::KeyTable;
use crate::penalty::ladder_step;
use crate::upstream::UpstreamClient;
use axum::http::{HeaderMap, Method};
use chrono::Utc;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cheap endpoint used for probes — a lightweight upstream GET.
/// Intentionally not a real chat/completion call.
const PROBE_PATH: &str = "/api/tags";

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Cached result of the most recent probe for one key, returned by
/// `on_demand_snapshot` without running a synchronous probe.
#[derive(Debug, Clone, Copy)]
pub struct CachedProbe {
    pub last_probe_status: Option<u16>,
    pub last_probe_ok: bool,
}

pub struct HealthController {
    table: Arc<KeyTable>,
    upstream: Arc<UpstreamClient>,
    cached_probes: Mutex<HashMap<usize, CachedProbe>>,
    upstream_ok: AtomicBool,
}

impl HealthController {
    pub fn new(table: Arc<KeyTable>, upstream: Arc<UpstreamClient>) -> Arc<Self> {
        Arc::new(HealthController {
            table,
            upstream,
            cached_probes: Mutex::new(HashMap::new()),
            upstream_ok: AtomicBool::new(true),
        })
    }

    /// Spawn the background tick loop. Stops accepting new ticks
    /// immediately on shutdown signal (caller drops the returned handle /
    /// aborts the task).
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                this.tick().await;
            }
        })
    }

    /// One health-check pass over every key whose penalty has expired.
    /// Availability is purely time-derived (a key with an expired
    /// `penalty_until` already reads as available before any probe runs),
    /// so this scans by `penalty_until` rather than by `available` —
    /// otherwise a recovering key would never get probed at all. Public so
    /// tests can force a pass without waiting for the tick interval.
    pub async fn tick(&self) {
        let snapshot = self.table.snapshot();
        let now = Utc::now();
        let mut any_available = false;

        for key in &snapshot {
            if key.available {
                any_available = true;
            }

            let due_for_probe = key.penalty_until.map(|until| until <= now).unwrap_or(false);
            if !due_for_probe {
                continue;
            }

            let result = self
                .upstream
                .call(
                    Method::GET,
                    self.table.secret(key.index),
                    PROBE_PATH,
                    None,
                    &HeaderMap::new(),
                    Vec::new(),
                )
                .await;

            match result {
                Ok(crate::upstream::UpstreamResponse::Success { .. }) => {
                    self.table.reset(key.index);
                    self.cached_probes.lock().insert(
                        key.index,
                        CachedProbe { last_probe_status: Some(200), last_probe_ok: true },
                    );
                    any_available = true;
                    info!("[health] key {} recovered", key.index);
                }
                Ok(crate::upstream::UpstreamResponse::Error { status: 429, .. }) => {
                    // Re-apply at the *current* backoff level — do not
                    // advance beyond what the dispatch path would.
                    self.table.update(key.index, |s, now| {
                        s.penalty_until = Some(now + ladder_step(s.backoff_level));
                        s.last_error_status = Some(429);
                        s.last_error_at = Some(now);
                    });
                    self.cached_probes.lock().insert(
                        key.index,
                        CachedProbe { last_probe_status: Some(429), last_probe_ok: false },
                    );
                    warn!("[health] key {} still rate-limited", key.index);
                }
                Ok(crate::upstream::UpstreamResponse::Error { status, .. }) => {
                    self.table.update(key.index, |s, now| {
                        s.penalty_until = Some(now + chrono::Duration::seconds(30));
                        s.last_error_status = Some(status);
                        s.last_error_at = Some(now);
                    });
                    self.cached_probes.lock().insert(
                        key.index,
                        CachedProbe { last_probe_status: Some(status), last_probe_ok: false },
                    );
                }
                Err(e) => {
                    self.table.update(key.index, |s, now| {
                        s.penalty_until = Some(now + chrono::Duration::seconds(30));
                        s.last_error_at = Some(now);
                    });
                    self.cached_probes
                        .lock()
                        .insert(key.index, CachedProbe { last_probe_status: None, last_probe_ok: false });
                    warn!("[health] probe for key {} failed locally: {}", key.index, e);
                }
            }
        }

        self.upstream_ok.store(any_available, Ordering::Relaxed);
    }

    /// `GET /health`'s `upstream_ok` — reflects the most recent tick.
    pub fn upstream_ok(&self) -> bool {
        self.upstream_ok.load(Ordering::Relaxed)
    }

    /// The dashboard's poll target: current key table plus cached probe
    /// results. Never runs a synchronous probe.
    pub fn on_demand_snapshot(&self) -> Vec<(crate::keytable::KeySnapshot, Option<CachedProbe>)> {
        let cache = self.cached_probes.lock();
        self.table
            .snapshot()
            .into_iter()
            .map(|snap| {
                let cached = cache.get(&snap.index).copied();
                (snap, cached)
            })
            .collect()
    }

    /// Operator reset; no probe is forced.
    pub fn operator_reset(&self, index: usize) {
        self.table.reset(index);
        self.cached_probes.lock().remove(&index);
    }
}
