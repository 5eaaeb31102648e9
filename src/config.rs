// src/config.rs

use serde::Deserialize;
use std::{env, fs, io, path::Path};
use tracing::{error, info, warn};

use crate::error::{PoolError, Result};
use crate::storage::QuotaLimits;

/// Connection settings for the durable key store.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// PostgreSQL connection URL. Overridable via `KEYPOOL_DATABASE_URL`
    /// or the conventional `DATABASE_URL`.
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Settings for the optional shared cache. No URL means no shared cache;
/// the pool then runs store-only, which is slower but fully correct.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Redis URL. Overridable via `KEYPOOL_REDIS_URL`.
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Name of the shared list holding available-key entries.
    #[serde(default = "default_cache_list_key")]
    pub list_key: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            list_key: default_cache_list_key(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ThrottleConfig {
    /// Minimum interval between two uses of the same key.
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: default_min_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CooldownConfig {
    /// Default cooldown applied when a key is disabled after an upstream
    /// rate-limit signal.
    #[serde(default = "default_rate_limit_cooldown")]
    pub rate_limit_secs: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            rate_limit_secs: default_rate_limit_cooldown(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct NotifyConfig {
    /// Slack incoming-webhook URL. Overridable via
    /// `KEYPOOL_SLACK_WEBHOOK_URL` or `SLACK_WEBHOOK_URL`.
    #[serde(default)]
    pub slack_webhook_url: Option<String>,
}

/// Root configuration, injected into every component at construction.
/// Nothing in the crate reads ambient global state after this is built.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub quota: QuotaLimits,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

fn default_max_connections() -> u32 {
    5
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_cache_list_key() -> String {
    "available_api_keys".to_string()
}
fn default_min_interval() -> u64 {
    30
}
fn default_rate_limit_cooldown() -> u64 {
    300
}

fn env_override(keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| env::var(k).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Loads configuration from an optional YAML file, then applies environment
/// overrides. A missing file is fine (defaults plus environment); an
/// unreadable or unparseable file is a configuration error.
pub fn load_config(path: &Path) -> Result<PoolConfig> {
    let path_str = path.display().to_string();
    let mut config = match fs::read_to_string(path) {
        Ok(contents) if contents.trim().is_empty() => {
            warn!("Config file '{}' is empty. Using defaults.", path_str);
            PoolConfig::default()
        }
        Ok(contents) => {
            let parsed: PoolConfig = serde_yaml::from_str(&contents)?;
            info!("Loaded configuration from '{}'.", path_str);
            parsed
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(
                "Config file '{}' not found. Using defaults and environment variables.",
                path_str
            );
            PoolConfig::default()
        }
        Err(e) => {
            return Err(PoolError::Io(io::Error::new(
                e.kind(),
                format!("Failed to read config file '{path_str}': {e}"),
            )))
        }
    };

    if let Some(url) = env_override(&["KEYPOOL_DATABASE_URL", "DATABASE_URL"]) {
        config.storage.database_url = url;
    }
    if let Some(url) = env_override(&["KEYPOOL_REDIS_URL", "REDIS_URL"]) {
        config.cache.redis_url = Some(url);
    }
    if let Some(url) = env_override(&["KEYPOOL_SLACK_WEBHOOK_URL", "SLACK_WEBHOOK_URL"]) {
        config.notify.slack_webhook_url = Some(url);
    }

    if !validate_config(&config) {
        return Err(PoolError::Config("Validation failed".to_string()));
    }
    Ok(config)
}

/// Performs validation checks on the configuration, logging each problem.
pub fn validate_config(cfg: &PoolConfig) -> bool {
    let mut has_errors = false;

    if cfg.storage.database_url.trim().is_empty() {
        error!(
            "No database URL configured. Set storage.database_url or KEYPOOL_DATABASE_URL."
        );
        has_errors = true;
    }
    if cfg.storage.max_connections == 0 {
        error!("storage.max_connections must be at least 1.");
        has_errors = true;
    }

    if cfg.quota.daily_request_limit <= 0 {
        error!(
            "quota.daily_request_limit must be positive, got {}.",
            cfg.quota.daily_request_limit
        );
        has_errors = true;
    }
    if cfg.quota.warning_threshold <= 0 || cfg.quota.warning_threshold >= cfg.quota.daily_request_limit
    {
        error!(
            "quota.warning_threshold ({}) must be between 1 and the daily request limit ({}).",
            cfg.quota.warning_threshold, cfg.quota.daily_request_limit
        );
        has_errors = true;
    }

    if cfg.cache.list_key.trim().is_empty() {
        error!("cache.list_key must not be empty.");
        has_errors = true;
    }

    !has_errors
}
