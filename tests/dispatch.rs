//! End-to-end coverage of the dispatch retry loop against a fake upstream,
//! using `wiremock` the way the resilience-primitive examples in the
//! retrieval pack test their retry/circuit-breaker behavior against a local
//! mock server rather than a live one.

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use keyproxy::config::Config;
use keyproxy::logbuffer::LogRingBuffer;
use keyproxy::routes;
use keyproxy::state::AppState;
use keyproxy::usage::{InMemoryUsageStore, UsageStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Requests routed to the fallback proxy handler need a `ConnectInfo`
/// extension — normally inserted by `into_make_service_with_connect_info`
/// on a real listener, which `Router::oneshot` bypasses in tests.
fn fake_peer() -> ConnectInfo<SocketAddr> {
    ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4242)))
}

fn test_config(upstream: &str, keys: Vec<&str>) -> Config {
    Config {
        keys: keys.into_iter().map(String::from).collect(),
        port: 0,
        proxy_auth_token: None,
        allow_unauthenticated_access: true,
        app_version: "test".into(),
        upstream_base_url: upstream.to_string(),
        max_body_bytes: 10 * 1024 * 1024,
    }
}

fn test_state(config: Config) -> AppState {
    let usage_store: Arc<dyn UsageStore> = Arc::new(InMemoryUsageStore::new());
    AppState::new(config, usage_store, Arc::new(LogRingBuffer::new()))
}

#[tokio::test]
async fn happy_path_returns_upstream_body_and_records_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"choices":[],"prompt_eval_count":10,"eval_count":20}"#)
                .insert_header("content-type", "application/json"),
        )
        .mount(&server)
        .await;

    let state = test_state(test_config(&server.uri(), vec!["key-a"]));
    let usage_store = state.usage_store.clone();
    let app = routes::router(state);

    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .extension(fake_peer())
        .body(Body::from(r#"{"model":"llama3"}"#))
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&body).contains("choices"));

    // Streaming capture runs after the body has fully drained.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let summary = usage_store.last_24h_summary(chrono::Utc::now());
    assert_eq!(summary.requests, 1);
    assert_eq!(summary.prompt_tokens, 10);
    assert_eq!(summary.completion_tokens, 20);
}

#[tokio::test]
async fn rate_limited_key_rotates_to_next_and_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok":true}"#))
        .with_priority(2)
        .mount(&server)
        .await;

    let state = test_state(test_config(&server.uri(), vec!["key-a", "key-b"]));
    let table = state.table.clone();
    let app = routes::router(state);

    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .extension(fake_peer())
        .body(Body::from("{}"))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Exactly one of the two keys should now be penalized, at the ladder's
    // first rung (15m) — a key's first rate limit must not jump straight
    // to the second rung.
    let penalized: Vec<_> = table.snapshot().into_iter().filter(|k| !k.available).collect();
    assert_eq!(penalized.len(), 1);
    let penalized = &penalized[0];
    assert_eq!(penalized.backoff_level, 1);
    let until = penalized.penalty_until.expect("penalized key must have a deadline");
    let delta = until - chrono::Utc::now();
    assert!(
        delta > chrono::Duration::minutes(14) && delta <= chrono::Duration::minutes(15),
        "expected ~15m deadline, got {delta}"
    );
}

#[tokio::test]
async fn all_keys_exhausted_surfaces_last_upstream_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("still limited"))
        .mount(&server)
        .await;

    let state = test_state(test_config(&server.uri(), vec!["key-a"]));
    let app = routes::router(state);

    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .extension(fake_peer())
        .body(Body::from("{}"))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    // With only one key, the first 429 both penalizes it and exhausts the
    // pool — exhaustion surfaces that upstream status verbatim rather than
    // a generic 503.
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn client_error_is_terminal_no_rotation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .mount(&server)
        .await;

    let state = test_state(test_config(&server.uri(), vec!["key-a", "key-b"]));
    let table = state.table.clone();
    let app = routes::router(state);

    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .extension(fake_peer())
        .body(Body::from("{}"))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Neither key was penalized: 4xx client errors are terminal, not
    // rotation-worthy.
    assert!(table.snapshot().into_iter().all(|k| k.available));
}

#[tokio::test]
async fn operator_reset_restores_availability_during_cooldown() {
    let server = MockServer::start().await;
    let state = test_state(test_config(&server.uri(), vec!["key-a"]));
    state.table.update(0, |s, now| {
        s.penalty_until = Some(now + chrono::Duration::hours(1));
        s.backoff_level = 3;
    });
    assert!(!state.table.snapshot_one(0).available);

    state.health.operator_reset(0);
    assert!(state.table.snapshot_one(0).available);
    assert_eq!(state.table.snapshot_one(0).backoff_level, 0);
}

#[tokio::test]
async fn admin_endpoints_require_auth_when_configured() {
    let server = MockServer::start().await;
    let mut config = test_config(&server.uri(), vec!["key-a"]);
    config.allow_unauthenticated_access = false;
    config.proxy_auth_token = Some("s3cret".to_string());
    let state = test_state(config);
    let app = routes::router(state);

    for uri in ["/health/keys", "/stats", "/stats/minute", "/stats/24h", "/logs"] {
        let req = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{uri} should require auth");

        let req = Request::builder()
            .method("GET")
            .uri(uri)
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "{uri} should accept the configured token");
    }
}

#[tokio::test]
async fn background_tick_rehabilitates_an_expired_penalty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&server)
        .await;

    let state = test_state(test_config(&server.uri(), vec!["key-a"]));
    state.table.update(0, |s, now| {
        s.penalty_until = Some(now - chrono::Duration::seconds(1));
        s.backoff_level = 1;
    });
    state.health.tick().await;
    let snap = state.table.snapshot_one(0);
    assert!(snap.available);
    assert_eq!(snap.backoff_level, 0);
}
