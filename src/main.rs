//! Process entry point: load configuration, assemble shared state, spawn
//! the background health controller, and serve the HTTP surface.
//!
//! The background-task-plus-serve shape mirrors the source crate's
//! `lib.rs::run` setup — there it's a Tauri app with a cron heartbeat spawned
//! in `.setup()`; here it's an axum server with the Health Controller's tick
//! loop spawned before `axum::serve` is awaited.

use clap::Parser;
use keyproxy::config::{Cli, Config};
use keyproxy::health::DEFAULT_TICK_INTERVAL;
use keyproxy::logbuffer::LogRingBuffer;
use keyproxy::routes;
use keyproxy::state::AppState;
use keyproxy::usage::InMemoryUsageStore;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() {
    keyproxy::config::init_logging();

    let cli = Cli::parse();
    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!("[main] configuration error: {e}");
            std::process::exit(1);
        }
    };

    info!(
        "[main] keyproxy {} starting with {} configured key(s)",
        config.app_version,
        config.keys.len()
    );

    let port = config.port;
    let usage_store: Arc<dyn keyproxy::usage::UsageStore> = Arc::new(InMemoryUsageStore::new());
    let logs = Arc::new(LogRingBuffer::new());
    let state = AppState::new(config, usage_store, logs);

    state.health.spawn(DEFAULT_TICK_INTERVAL);

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("[main] failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    info!("[main] listening on {addr}");
    if let Err(e) = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await {
        error!("[main] server error: {e}");
        std::process::exit(1);
    }
}
