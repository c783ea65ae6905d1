//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.convo/config.json`) and environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// mirai-api-http connection settings.
    #[serde(default)]
    pub mirai: MiraiConfig,

    /// Routing settings.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

/// mirai-api-http HTTP adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiraiConfig {
    /// HTTP adapter base URL (default "http://127.0.0.1:8080"). Overridden by MIRAI_BASE_URL env.
    #[serde(default = "default_mirai_base_url")]
    pub base_url: String,

    /// Verify key configured in mirai-api-http. Overridden by MIRAI_VERIFY_KEY env.
    pub verify_key: Option<String>,

    /// Bot account the session is bound to.
    #[serde(default)]
    pub qq: i64,

    /// Messages requested per fetchMessage call (default 10).
    #[serde(default = "default_fetch_count")]
    pub fetch_count: u32,

    /// Pause after an empty fetch, in milliseconds (default 500).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_mirai_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_fetch_count() -> u32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for MiraiConfig {
    fn default() -> Self {
        Self {
            base_url: default_mirai_base_url(),
            verify_key: None,
            qq: 0,
            fetch_count: default_fetch_count(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl MiraiConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherConfig {
    /// When set, a conversation waiting longer than this for its next message is aborted.
    pub idle_timeout_secs: Option<u64>,
}

impl DispatcherConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the verify key: env MIRAI_VERIFY_KEY overrides config.
pub fn resolve_verify_key(config: &Config) -> Option<String> {
    env_non_empty("MIRAI_VERIFY_KEY").or_else(|| {
        config
            .mirai
            .verify_key
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the HTTP adapter base URL: env MIRAI_BASE_URL overrides config.
pub fn resolve_base_url(config: &Config) -> String {
    env_non_empty("MIRAI_BASE_URL").unwrap_or_else(|| config.mirai.base_url.trim().to_string())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CONVO_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".convo").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, or the default path (or CONVO_CONFIG_PATH). Missing file => default config.
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
