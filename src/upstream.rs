//! Upstream Client (C4) — issues a single HTTPS call to the configured
//! upstream with a chosen key, and streams 2xx responses through.
//!
//! Connection pooling: callers share one `reqwest::Client` across the
//! process (cloning it is cheap — it's `Arc`-backed internally), the same
//! discipline the source crate's provider clients use via their shared
//! `reqwest::Client` (see `engine/http.rs::pinned_client`). This proxy
//! forwards whatever TLS backend `reqwest`'s `rustls-tls` feature selects.

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use reqwest::Client;

/// Bounded read for non-2xx error bodies.
const MAX_ERROR_BODY_BYTES: usize = 8 * 1024;

/// Headers that must never be forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&lower.as_str()) || lower.starts_with("proxy-")
}

/// Strip a leading `/api` or `/v1` segment from the client path when the
/// upstream base already implies that prefix, and never produce a doubled
/// `/api/api` or `/v1/v1` on the wire.
pub fn clean_path(client_path: &str, upstream_base: &str) -> String {
    let base_has_api = upstream_base.contains("/api");
    let base_has_v1 = upstream_base.contains("/v1");

    let mut path = client_path.to_string();
    if base_has_api && (path == "/api" || path.starts_with("/api/")) {
        path = path.strip_prefix("/api").unwrap_or(&path).to_string();
    } else if base_has_v1 && (path == "/v1" || path.starts_with("/v1/")) {
        path = path.strip_prefix("/v1").unwrap_or(&path).to_string();
    }
    if path.is_empty() {
        path = "/".to_string();
    }
    path
}

/// Build the outbound header set: drop the client's `Authorization` and
/// `Host`, drop hop-by-hop headers, pass everything else through verbatim,
/// then set the upstream bearer and host.
pub fn build_upstream_headers(client_headers: &HeaderMap, key_secret: &str, upstream_host: &str) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in client_headers.iter() {
        let lname = name.as_str().to_ascii_lowercase();
        if lname == "authorization" || lname == "host" || is_hop_by_hop(&lname) {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    out.insert(
        HeaderName::from_static("authorization"),
        HeaderValue::from_str(&format!("Bearer {key_secret}")).expect("bearer header value"),
    );
    if let Ok(hv) = HeaderValue::from_str(upstream_host) {
        out.insert(HeaderName::from_static("host"), hv);
    }
    out
}

/// Outcome of issuing one upstream call.
pub enum UpstreamResponse {
    /// 2xx — caller streams `body` to the client.
    Success {
        status: u16,
        headers: axum::http::HeaderMap,
        body: reqwest::Response,
    },
    /// Non-2xx — body already fully (bounded) read, response closed.
    Error {
        status: u16,
        body: Vec<u8>,
        content_type: Option<String>,
    },
}

pub struct UpstreamClient {
    http: Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(http: Client, base_url: String) -> Self {
        UpstreamClient { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issue one call. Returns `Err(message)` only for network/TLS/timeout
    /// failures observed before any upstream status line was received
    /// (classified as `LocalError` by the dispatch engine).
    pub async fn call(
        &self,
        method: Method,
        key_secret: &str,
        path: &str,
        query: Option<&str>,
        client_headers: &HeaderMap,
        body: Vec<u8>,
    ) -> Result<UpstreamResponse, String> {
        let cleaned = clean_path(path, &self.base_url);
        let mut url = format!("{}{}", self.base_url.trim_end_matches('/'), cleaned);
        if let Some(q) = query {
            if !q.is_empty() {
                url.push('?');
                url.push_str(q);
            }
        }

        let upstream_host = reqwest::Url::parse(&self.base_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_default();

        let headers = build_upstream_headers(client_headers, key_secret, &upstream_host);

        let mut req = self.http.request(method, &url);
        for (name, value) in headers.iter() {
            req = req.header(name, value);
        }
        if !body.is_empty() {
            req = req.body(body);
        }

        let resp = req.send().await.map_err(|e| format!("upstream request failed: {e}"))?;
        let status = resp.status().as_u16();

        if (200..300).contains(&status) {
            let mut out_headers = axum::http::HeaderMap::new();
            for (name, value) in resp.headers().iter() {
                if is_hop_by_hop(name.as_str()) {
                    continue;
                }
                out_headers.insert(name.clone(), value.clone());
            }
            Ok(UpstreamResponse::Success {
                status,
                headers: out_headers,
                body: resp,
            })
        } else {
            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let full = resp.bytes().await.map_err(|e| format!("reading error body: {e}"))?;
            let truncated: Vec<u8> = full.iter().take(MAX_ERROR_BODY_BYTES).copied().collect();
            Ok(UpstreamResponse::Error {
                status,
                body: truncated,
                content_type,
            })
        }
    }
}
