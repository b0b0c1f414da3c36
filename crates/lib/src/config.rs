//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.chatsync/config.json`) and environment.
//! Every field has a default, so a missing file or `{}` is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::store::DEFAULT_MAX_BACKLOG;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Backend server to talk to.
    #[serde(default)]
    pub server: ServerConfig,

    /// Event backlog and dispatch tuning.
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Backend server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Base URL of the server (default "http://127.0.0.1:56050"). Overridden by CHATSYNC_SERVER_URL.
    #[serde(default = "default_server_url")]
    pub url: String,

    /// Project directory to scope requests to, sent as the `directory` query parameter.
    #[serde(default)]
    pub directory: Option<String>,

    /// Timeout for request/response calls in milliseconds. Not applied to the event stream.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_server_url() -> String {
    "http://127.0.0.1:56050".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            directory: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// How the dispatch loop groups backlog changes into passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStrategy {
    /// One pass per backlog change.
    #[default]
    Immediate,
    /// Wait for `batchSize` events or `debounceMs` of quiet, whichever comes first.
    Batched,
}

/// Backlog bound, dispatch strategy, and retry bound for deferred events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Maximum events kept in the backlog; the oldest are dropped past this (default 100).
    #[serde(default = "default_max_backlog")]
    pub max_backlog: usize,

    #[serde(default)]
    pub mode: DispatchStrategy,

    /// Backlog length that triggers a batched pass right away (default 20).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Quiet period before a batched pass in milliseconds (default 300).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// A deferred event older than this is dropped with a warning (default 30000).
    #[serde(default = "default_deferred_ttl_ms")]
    pub deferred_ttl_ms: u64,
}

fn default_max_backlog() -> usize {
    DEFAULT_MAX_BACKLOG
}

fn default_batch_size() -> usize {
    20
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_deferred_ttl_ms() -> u64 {
    30_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_backlog: default_max_backlog(),
            mode: DispatchStrategy::default(),
            batch_size: default_batch_size(),
            debounce_ms: default_debounce_ms(),
            deferred_ttl_ms: default_deferred_ttl_ms(),
        }
    }
}

/// Resolve the server base URL: env CHATSYNC_SERVER_URL overrides config. Trailing slashes are removed.
pub fn resolve_server_url(config: &Config) -> String {
    std::env::var("CHATSYNC_SERVER_URL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| config.server.url.trim().to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CHATSYNC_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".chatsync").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, or the default path (or CHATSYNC_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.server.url, "http://127.0.0.1:56050");
        assert_eq!(config.server.timeout_ms, 30_000);
        assert_eq!(config.sync.max_backlog, 100);
        assert_eq!(config.sync.mode, DispatchStrategy::Immediate);
        assert_eq!(config.sync.batch_size, 20);
        assert_eq!(config.sync.debounce_ms, 300);
    }

    #[test]
    fn camel_case_keys_are_read() {
        let config: Config = serde_json::from_str(
            r#"{"server":{"url":"http://box:4096/","timeoutMs":5},
                "sync":{"maxBacklog":7,"mode":"batched","debounceMs":50,"deferredTtlMs":9}}"#,
        )
        .unwrap();
        assert_eq!(config.server.timeout(), Duration::from_millis(5));
        assert_eq!(config.sync.max_backlog, 7);
        assert_eq!(config.sync.mode, DispatchStrategy::Batched);
        assert_eq!(config.sync.debounce_ms, 50);
        assert_eq!(config.sync.deferred_ttl_ms, 9);
        assert_eq!(config.sync.batch_size, 20);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join("chatsync-config-test-missing/config.json");
        let (config, used) = load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert_eq!(config.sync.max_backlog, 100);
    }
}
