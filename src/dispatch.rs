//! Dispatch Engine (C5) — the per-request state machine tying the Selector,
//! Upstream Client, and Penalty Policy into one retry loop.
//!
//! The retry loop itself mirrors the source crate's provider retry loops
//! (`engine/providers/openai.rs`: pick, call, classify, decide whether to
//! retry) and the rotate-on-429 shape from the key-pool proxy reference in
//! the retrieval pack (`berry-13-key-cycle-proxy::proxy::upstream`), adapted
//! from a single static key list to this crate's `KeyTable`.

use crate::error::ProxyError;
use crate::keytable::KeyTable;
use crate::logbuffer::{LogEntry, LogRingBuffer};
use crate::penalty::{self, Outcome};
use crate::selector;
use crate::state::AppState;
use crate::upstream::UpstreamResponse;
use crate::usage::UsageEvent;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Response, StatusCode};
use axum::response::IntoResponse;
use chrono::Utc;
use futures::Stream;
use log::warn;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

/// How much of the trailing response body to keep around for best-effort
/// token-count parsing, which must never block or delay the response. Large
/// enough for a typical non-streaming chat completion or the last SSE frame
/// of a streamed one.
const USAGE_TAIL_BYTES: usize = 64 * 1024;

fn classify(result: &Result<UpstreamResponse, String>) -> (Outcome, Option<u16>) {
    match result {
        Ok(UpstreamResponse::Success { status, .. }) => (Outcome::Success, Some(*status)),
        Ok(UpstreamResponse::Error { status: 429, .. }) => (Outcome::RateLimited, Some(429)),
        Ok(UpstreamResponse::Error { status, .. }) if matches!(status, 500 | 502 | 503 | 504) => {
            (Outcome::UpstreamTransient, Some(*status))
        }
        Ok(UpstreamResponse::Error { status, .. }) => (Outcome::UpstreamClientError, Some(*status)),
        Err(_) => (Outcome::LocalError, None),
    }
}

/// Run one request through the retry loop and return the axum response to
/// send to the client. Never panics on a missing usage field — token
/// accounting is best-effort and an accounting failure never fails the
/// response (`AccountingFailure`).
#[allow(clippy::too_many_arguments)]
pub async fn dispatch(
    state: &AppState,
    method: Method,
    path: &str,
    query: Option<&str>,
    client_headers: HeaderMap,
    body: Vec<u8>,
    client_ip: String,
) -> Result<Response<Body>, ProxyError> {
    let mut exclude: HashSet<usize> = HashSet::new();
    let mut last_upstream_error: Option<(u16, Vec<u8>, Option<String>)> = None;
    let mut last_local_error: Option<String> = None;
    let model = extract_model(&body).unwrap_or_else(|| "unknown".to_string());
    let request_id = uuid::Uuid::new_v4().to_string();

    loop {
        let hint = state.usage_store.recent_usage_hint(Utc::now());
        let key_index = match selector::select(&state.table, &exclude, &hint) {
            Ok(i) => i,
            Err(e) => {
                return match (last_upstream_error, last_local_error) {
                    (Some((status, resp_body, content_type)), _) => {
                        Err(ProxyError::UpstreamStatus { status, body: resp_body, content_type })
                    }
                    (None, Some(msg)) => Err(ProxyError::UpstreamLocal(msg)),
                    (None, None) => Err(ProxyError::NoKeyAvailable(e.to_string())),
                };
            }
        };

        let started = Instant::now();
        let result = state
            .upstream
            .call(method.clone(), state.table.secret(key_index), path, query, &client_headers, body.clone())
            .await;
        let (outcome, status_opt) = classify(&result);

        match result {
            Ok(UpstreamResponse::Success { status, headers, body: upstream_body }) => {
                log_attempt(&state.logs, &request_id, &method, path, Some(key_index), status, started, &client_ip);
                return Ok(stream_success(state.clone_handles(), key_index, path, &model, client_ip, status, headers, upstream_body));
            }
            Ok(UpstreamResponse::Error { status, body: resp_body, content_type }) if outcome == Outcome::UpstreamClientError => {
                log_attempt(&state.logs, &request_id, &method, path, Some(key_index), status, started, &client_ip);
                return Err(ProxyError::UpstreamStatus { status, body: resp_body, content_type });
            }
            Ok(UpstreamResponse::Error { status, body: resp_body, content_type }) => {
                log_attempt(&state.logs, &request_id, &method, path, Some(key_index), status, started, &client_ip);
                apply_penalty(&state.table, key_index, outcome, status_opt);
                exclude.insert(key_index);
                last_upstream_error = Some((status, resp_body, content_type));
                last_local_error = None;
            }
            Err(msg) => {
                log_attempt(&state.logs, &request_id, &method, path, Some(key_index), 0, started, &client_ip);
                warn!("[dispatch] key {key_index} local error: {msg}");
                apply_penalty(&state.table, key_index, outcome, status_opt);
                exclude.insert(key_index);
                last_upstream_error = None;
                last_local_error = Some(msg);
            }
        }
    }
}

fn apply_penalty(table: &KeyTable, key_index: usize, outcome: Outcome, status: Option<u16>) {
    let current_level = table.snapshot_one(key_index).backoff_level;
    let Some(decided) = penalty::decide(outcome, current_level, Utc::now()) else {
        return;
    };
    table.update(key_index, |s, now| {
        // Never shorten an existing penalty — a slower attempt finishing
        // after a faster one already rotated away must not undo it.
        let advances = s.penalty_until.map(|cur| decided.penalty_until > cur).unwrap_or(true);
        if advances {
            s.penalty_until = Some(decided.penalty_until);
            s.backoff_level = decided.new_backoff_level;
        }
        s.last_error_status = status;
        s.last_error_at = Some(now);
    });
}

#[allow(clippy::too_many_arguments)]
fn log_attempt(
    logs: &LogRingBuffer,
    request_id: &str,
    method: &Method,
    path: &str,
    key_index: Option<usize>,
    status: u16,
    started: Instant,
    client_ip: &str,
) {
    logs.push(LogEntry {
        request_id: request_id.to_string(),
        timestamp_utc: Utc::now(),
        method: method.to_string(),
        path: path.to_string(),
        key_index,
        status,
        duration_ms: started.elapsed().as_millis() as u64,
        client_ip: client_ip.to_string(),
    });
}

/// Best-effort `model` field extraction from the request body, for usage
/// tagging. Absence is not an error — most admin/GET calls have no body.
fn extract_model(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let v: Value = serde_json::from_slice(body).ok()?;
    v.get("model")?.as_str().map(str::to_string)
}

/// Parse trailing token counts from a captured response tail. Tries the
/// whole buffer as one JSON object first (non-streaming), then falls back to
/// scanning lines in reverse for the last parseable SSE `data:` frame.
fn parse_token_usage(tail: &[u8]) -> Option<(u64, u64)> {
    if let Ok(v) = serde_json::from_slice::<Value>(tail) {
        if let Some(counts) = extract_counts(&v) {
            return Some(counts);
        }
    }
    let text = String::from_utf8_lossy(tail);
    for line in text.lines().rev() {
        let line = line.trim();
        let data = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        if let Ok(v) = serde_json::from_str::<Value>(data) {
            if let Some(counts) = extract_counts(&v) {
                return Some(counts);
            }
        }
    }
    None
}

fn extract_counts(v: &Value) -> Option<(u64, u64)> {
    let prompt = v
        .get("prompt_eval_count")
        .or_else(|| v.pointer("/usage/prompt_tokens"))
        .or_else(|| v.get("prompt_tokens"))
        .and_then(Value::as_u64);
    let completion = v
        .get("eval_count")
        .or_else(|| v.pointer("/usage/completion_tokens"))
        .or_else(|| v.get("completion_tokens"))
        .and_then(Value::as_u64);
    match (prompt, completion) {
        (Some(p), Some(c)) => Some((p, c)),
        _ => None,
    }
}

/// The handles `stream_success` needs after the dispatch call has otherwise
/// returned — cloned out of `AppState` so the response stream can outlive
/// the request-handling stack frame.
struct StreamHandles {
    usage_store: Arc<dyn crate::usage::UsageStore>,
}

impl AppState {
    fn clone_handles(&self) -> StreamHandles {
        StreamHandles { usage_store: self.usage_store.clone() }
    }
}

fn stream_success(
    handles: StreamHandles,
    key_index: usize,
    path: &str,
    model: &str,
    client_ip: String,
    status: u16,
    headers: HeaderMap,
    upstream_body: reqwest::Response,
) -> Response<Body> {
    let captured = Arc::new(Mutex::new(Vec::<u8>::new()));
    let path = path.to_string();
    let model = model.to_string();

    let on_complete: Box<dyn FnOnce() + Send> = {
        let captured = captured.clone();
        Box::new(move || {
            let tail = captured.lock();
            let (prompt_tokens, completion_tokens) = parse_token_usage(&tail).unwrap_or((0, 0));
            let event = UsageEvent {
                key_index,
                model,
                client_ip,
                prompt_tokens,
                completion_tokens,
                timestamp_utc: Utc::now(),
                path,
                request_archive_id: None,
            };
            if let Err(e) = handles.usage_store.record(event) {
                warn!("[dispatch] usage accounting failed: {e}");
            }
        })
    };

    let capturing = CapturingStream {
        inner: Box::pin(upstream_body.bytes_stream()),
        captured,
        on_complete: Some(on_complete),
    };

    let mut builder = Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(capturing))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Wraps the upstream byte stream: forwards every chunk untouched, mirrors
/// the trailing bytes into `captured` (bounded to `USAGE_TAIL_BYTES`), and
/// fires `on_complete` exactly once when the stream ends. If the client
/// disconnects before the stream ends, this value is simply dropped without
/// polling to completion — no usage event is emitted.
struct CapturingStream {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
    captured: Arc<Mutex<Vec<u8>>>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl Stream for CapturingStream {
    type Item = reqwest::Result<bytes::Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let mut buf = this.captured.lock();
                buf.extend_from_slice(&chunk);
                if buf.len() > USAGE_TAIL_BYTES {
                    let excess = buf.len() - USAGE_TAIL_BYTES;
                    buf.drain(0..excess);
                }
                drop(buf);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => {
                if let Some(cb) = this.on_complete.take() {
                    cb();
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_model_reads_json_field() {
        let body = br#"{"model": "llama3", "messages": []}"#;
        assert_eq!(extract_model(body), Some("llama3".to_string()));
    }

    #[test]
    fn extract_model_tolerates_missing_or_invalid_body() {
        assert_eq!(extract_model(b""), None);
        assert_eq!(extract_model(b"not json"), None);
    }

    #[test]
    fn parse_token_usage_reads_whole_body_json() {
        let tail = br#"{"prompt_eval_count": 12, "eval_count": 34}"#;
        assert_eq!(parse_token_usage(tail), Some((12, 34)));
    }

    #[test]
    fn parse_token_usage_reads_openai_style_usage_object() {
        let tail = br#"{"usage": {"prompt_tokens": 5, "completion_tokens": 7}}"#;
        assert_eq!(parse_token_usage(tail), Some((5, 7)));
    }

    #[test]
    fn parse_token_usage_scans_sse_frames_in_reverse() {
        let tail = b"data: {\"delta\": \"hi\"}\n\ndata: {\"prompt_eval_count\": 2, \"eval_count\": 3}\n\ndata: [DONE]\n";
        assert_eq!(parse_token_usage(tail), Some((2, 3)));
    }

    #[test]
    fn parse_token_usage_returns_none_when_absent() {
        assert_eq!(parse_token_usage(b"{\"delta\": \"hi\"}"), None);
    }
}
