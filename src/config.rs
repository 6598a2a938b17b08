//! Configuration sources: `config/config.yaml` (the only source of API
//! keys) overlaid with environment variables, the same layering the source
//! crate's `commands/config.rs` applies between persisted and runtime config.

use crate::error::{ProxyError, ProxyResult};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "keyproxy", about = "Reverse proxy for a pooled-key inference API")]
pub struct Cli {
    /// Path to the YAML config file holding the key list.
    #[arg(long, default_value = "config/config.yaml")]
    pub config: PathBuf,
}

/// Shape of `config/config.yaml`.
#[derive(Debug, Deserialize)]
pub struct KeysFile {
    pub keys: Vec<String>,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub keys: Vec<String>,
    pub port: u16,
    pub proxy_auth_token: Option<String>,
    pub allow_unauthenticated_access: bool,
    pub app_version: String,
    pub upstream_base_url: String,
    pub max_body_bytes: usize,
}

const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.inference.example.com";
const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

impl Config {
    /// Load the key list from `path`, then overlay environment variables.
    pub fn load(path: &std::path::Path) -> ProxyResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigInvalid(format!("reading {}: {e}", path.display()))
        })?;
        let parsed: KeysFile = serde_yaml::from_str(&raw).map_err(|e| {
            ProxyError::ConfigInvalid(format!("parsing {}: {e}", path.display()))
        })?;

        if parsed.keys.is_empty() {
            return Err(ProxyError::ConfigInvalid(
                "config.yaml `keys` list is empty".into(),
            ));
        }

        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        let proxy_auth_token = std::env::var("PROXY_AUTH_TOKEN").ok().filter(|s| !s.is_empty());

        let allow_unauthenticated_access = std::env::var("ALLOW_UNAUTHENTICATED_ACCESS")
            .ok()
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if proxy_auth_token.is_none() && !allow_unauthenticated_access {
            return Err(ProxyError::ConfigInvalid(
                "PROXY_AUTH_TOKEN is unset and ALLOW_UNAUTHENTICATED_ACCESS is not true".into(),
            ));
        }

        let app_version =
            std::env::var("APP_VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());

        let upstream_base_url = std::env::var("UPSTREAM_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_UPSTREAM_BASE_URL.to_string());

        Ok(Config {
            keys: parsed.keys,
            port,
            proxy_auth_token,
            allow_unauthenticated_access,
            app_version,
            upstream_base_url,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        })
    }
}

/// Initialize the logger from `LOG_LEVEL`, defaulting to `info`.
pub fn init_logging() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}
