//! HTTP surface: the administrative endpoints plus the catch-all proxy
//! route, wired the way the source crate's `webchat` server pairs a small
//! set of named routes with one fallback handler (`engine/webchat/server.rs`),
//! reimplemented here on top of `axum`.

use crate::dispatch;
use crate::error::ProxyError;
use crate::state::AppState;
use crate::usage::parse_window;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/dashboard", get(dashboard))
        .route("/health", get(health))
        .route("/health/keys", get(health_keys))
        .route("/health/keys/:index/reset", post(health_keys_reset))
        .route("/stats", get(stats))
        .route("/stats/minute", get(stats_minute))
        .route("/stats/24h", get(stats_24h))
        .route("/logs", get(logs))
        .fallback(proxy)
        .with_state(state)
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ProxyError> {
    let Some(expected) = &state.config.proxy_auth_token else {
        if state.config.allow_unauthenticated_access {
            return Ok(());
        }
        return Err(ProxyError::Unauthorized);
    };

    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(ProxyError::Unauthorized),
    }
}

async fn root() -> impl IntoResponse {
    (StatusCode::FOUND, [(axum::http::header::LOCATION, "/dashboard")])
}

const DASHBOARD_HTML: &str = r#"<!doctype html>
<html>
<head><title>keyproxy</title></head>
<body>
<h1>keyproxy</h1>
<p>See <a href="/health">/health</a>, <a href="/health/keys">/health/keys</a>,
<a href="/stats">/stats</a>, <a href="/logs">/logs</a>.</p>
</body>
</html>"#;

async fn dashboard() -> impl IntoResponse {
    ([(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")], DASHBOARD_HTML)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "proxy_ok": true,
        "upstream_ok": state.health.upstream_ok(),
        "version": state.config.app_version,
        "keys_total": state.table.len(),
    }))
}

async fn health_keys(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, ProxyError> {
    check_auth(&state, &headers)?;
    let snapshot: Vec<_> = state
        .health
        .on_demand_snapshot()
        .into_iter()
        .map(|(key, probe)| {
            json!({
                "index": key.index,
                "available": key.available,
                "penalty_until": key.penalty_until,
                "backoff_level": key.backoff_level,
                "last_error_status": key.last_error_status,
                "last_error_at": key.last_error_at,
                "last_probe_status": probe.and_then(|p| p.last_probe_status),
                "last_probe_ok": probe.map(|p| p.last_probe_ok),
            })
        })
        .collect();
    Ok(Json(snapshot))
}

async fn health_keys_reset(
    State(state): State<AppState>,
    axum::extract::Path(index): axum::extract::Path<usize>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ProxyError> {
    check_auth(&state, &headers)?;
    if index >= state.table.len() {
        return Ok((StatusCode::NOT_FOUND, Json(json!({"error": "no such key index"}))));
    }
    state.health.operator_reset(index);
    Ok((StatusCode::OK, Json(json!({"index": index, "reset": true}))))
}

async fn stats(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, ProxyError> {
    check_auth(&state, &headers)?;
    Ok(Json(state.usage_store.hourly_summary()))
}

#[derive(Deserialize)]
struct MinuteQuery {
    window: Option<String>,
}

async fn stats_minute(
    State(state): State<AppState>,
    Query(q): Query<MinuteQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ProxyError> {
    check_auth(&state, &headers)?;
    let raw = q.window.as_deref().unwrap_or("60m");
    let window = parse_window(raw).ok_or_else(|| ProxyError::BadRequest(format!("unsupported window: {raw}")))?;
    Ok(Json(state.usage_store.minute_buckets(window, chrono::Utc::now())))
}

async fn stats_24h(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, ProxyError> {
    check_auth(&state, &headers)?;
    Ok(Json(state.usage_store.last_24h_summary(chrono::Utc::now())))
}

async fn logs(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, ProxyError> {
    check_auth(&state, &headers)?;
    Ok(Json(state.logs.recent(200)))
}

/// Catch-all: anything not matched above is proxied upstream.
async fn proxy(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, ProxyError> {
    check_auth(&state, &headers)?;

    if body.len() > state.config.max_body_bytes {
        return Err(ProxyError::BodyTooLarge);
    }

    let path = uri.path();
    let query = uri.query();
    dispatch::dispatch(&state, method, path, query, headers, body.to_vec(), addr.ip().to_string()).await
}
