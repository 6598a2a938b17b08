//! Shared application state, assembled once at startup and cloned (as an
//! `Arc`) into every request task — the same "one `EngineState`, `Arc`
//! fields, `parking_lot::Mutex` where mutation is needed" shape the source
//! crate uses for its `EngineState` (`engine/state.rs`).

use crate::config::Config;
use crate::health::HealthController;
use crate::keytable::KeyTable;
use crate::logbuffer::LogRingBuffer;
use crate::upstream::UpstreamClient;
use crate::usage::{ArchiveSink, NoopArchiveSink, UsageStore};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub table: Arc<KeyTable>,
    pub upstream: Arc<UpstreamClient>,
    pub usage_store: Arc<dyn UsageStore>,
    pub archive: Arc<dyn ArchiveSink>,
    pub health: Arc<HealthController>,
    pub logs: Arc<LogRingBuffer>,
}

impl AppState {
    pub fn new(config: Config, usage_store: Arc<dyn UsageStore>, logs: Arc<LogRingBuffer>) -> Self {
        let config = Arc::new(config);
        let table = Arc::new(KeyTable::new(config.keys.clone()));

        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        let upstream = Arc::new(UpstreamClient::new(http, config.upstream_base_url.clone()));
        let health = HealthController::new(table.clone(), upstream.clone());

        AppState {
            config,
            table,
            upstream,
            usage_store,
            archive: Arc::new(NoopArchiveSink),
            health,
            logs,
        }
    }
}
