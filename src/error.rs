//! Canonical error type for the proxy core, built with `thiserror`.
//!
//! Design rules (carried from the source crate's `atoms::error`):
//!   * Variants are coarse-grained by domain.
//!   * `#[from]` wires std/external error conversions automatically.
//!   * No variant ever carries a secret key value.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Startup-only: missing/empty key list, unreadable config, bind failure.
    #[error("configuration error: {0}")]
    ConfigInvalid(String),

    /// Client lacks (or has an invalid) proxy auth token.
    #[error("unauthorized")]
    Unauthorized,

    /// Malformed or unsupported client-supplied input (e.g. a `?window=`
    /// value outside the enumerated set).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// All configured keys are penalized or excluded.
    #[error("no upstream key available: {0}")]
    NoKeyAvailable(String),

    /// Client body exceeded the configured maximum.
    #[error("request body too large")]
    BodyTooLarge,

    /// Non-2xx upstream response that survived the retry loop, to be
    /// proxied through verbatim.
    #[error("upstream returned {status}")]
    UpstreamStatus { status: u16, body: Vec<u8>, content_type: Option<String> },

    /// Network/TLS/timeout failure before any upstream status was observed,
    /// with every key exhausted.
    #[error("upstream unreachable: {0}")]
    UpstreamLocal(String),

    /// Non-fatal accounting failure; never surfaced to the client.
    #[error("accounting failure: {0}")]
    AccountingFailure(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                axum::Json(json!({"error": "unauthorized"})),
            )
                .into_response(),
            ProxyError::BadRequest(reason) => (
                StatusCode::BAD_REQUEST,
                axum::Json(json!({"error": reason})),
            )
                .into_response(),
            ProxyError::BodyTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                axum::Json(json!({"error": "request body too large"})),
            )
                .into_response(),
            ProxyError::NoKeyAvailable(reason) => (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(json!({"error": "no upstream key available", "reason": reason})),
            )
                .into_response(),
            ProxyError::UpstreamStatus { status, body, content_type } => {
                let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                let mut resp = Response::builder().status(code);
                if let Some(ct) = content_type {
                    resp = resp.header(axum::http::header::CONTENT_TYPE, ct);
                }
                resp.body(axum::body::Body::from(body)).unwrap_or_else(|_| {
                    StatusCode::BAD_GATEWAY.into_response()
                })
            }
            ProxyError::UpstreamLocal(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(json!({"error": "upstream unreachable"})),
            )
                .into_response(),
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({"error": other.to_string()})),
            )
                .into_response(),
        }
    }
}
