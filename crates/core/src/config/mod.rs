//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (CRMSYNC_*)
//! 2. TOML config file (if CRMSYNC_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (CRMSYNC_*)
/// 2. TOML config file (if CRMSYNC_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the SQLite file shared by every tab of one profile.
    ///
    /// Set via CRMSYNC_DB_PATH environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Path to the relational mirror database served by `crm-mirror`.
    ///
    /// Set via CRMSYNC_MIRROR_DB_PATH environment variable.
    #[serde(default = "default_mirror_db_path")]
    pub mirror_db_path: PathBuf,

    /// Stable identifier of this tab. Generated at startup when unset.
    #[serde(default)]
    pub tab_id: Option<String>,

    /// Owner stamped on documents that do not carry one.
    #[serde(default)]
    pub owner_id: Option<String>,

    /// Lease renewal interval in milliseconds.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Lease timeout in milliseconds. Must exceed the heartbeat.
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,

    /// How often sibling tabs poll the shared change log.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Reconnect backoff base delay in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Reconnect backoff cap in milliseconds.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Attempts for a remote write before a transient failure is surfaced.
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,

    /// Byte quota for cached documents in the local store.
    #[serde(default = "default_cache_quota_bytes")]
    pub cache_quota_bytes: u64,

    /// Change log rows the lease holder keeps when compacting.
    #[serde(default = "default_change_log_retention")]
    pub change_log_retention: u64,

    /// Base URL of the authoritative remote store.
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Base URL of the mirror API.
    #[serde(default)]
    pub mirror_url: Option<String>,

    /// Origin that relative asset manifest URLs resolve against.
    #[serde(default = "default_asset_origin")]
    pub asset_origin: String,

    /// HTTP request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// User-Agent string for HTTP requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Socket address the mirror API binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./crmsync-local.sqlite")
}

fn default_mirror_db_path() -> PathBuf {
    PathBuf::from("./crmsync-mirror.sqlite")
}

fn default_heartbeat_ms() -> u64 {
    1_000
}

fn default_lease_timeout_ms() -> u64 {
    3_000
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_write_attempts() -> u32 {
    3
}

fn default_cache_quota_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_change_log_retention() -> u64 {
    10_000
}

fn default_asset_origin() -> String {
    "http://localhost:5000".into()
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_user_agent() -> String {
    "crmsync/0.1".into()
}

fn default_listen_addr() -> String {
    "0.0.0.0:5000".into()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            mirror_db_path: default_mirror_db_path(),
            tab_id: None,
            owner_id: None,
            heartbeat_ms: default_heartbeat_ms(),
            lease_timeout_ms: default_lease_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            write_attempts: default_write_attempts(),
            cache_quota_bytes: default_cache_quota_bytes(),
            change_log_retention: default_change_log_retention(),
            remote_url: None,
            mirror_url: None,
            asset_origin: default_asset_origin(),
            timeout_ms: default_timeout_ms(),
            user_agent: default_user_agent(),
            listen_addr: default_listen_addr(),
        }
    }
}

impl AppConfig {
    /// Timeout as Duration for use with reqwest/tokio.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `CRMSYNC_`
    /// 2. TOML file from `CRMSYNC_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("CRMSYNC_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("CRMSYNC_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        Self::from_figment(figment)
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Mirror API base URL (for the mirror writer).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if the mirror URL is not set.
    pub fn require_mirror_url(&self) -> Result<&str, ConfigError> {
        self.mirror_url.as_deref().ok_or_else(|| ConfigError::Missing {
            field: "mirror_url".into(),
            hint: "Set CRMSYNC_MIRROR_URL environment variable".into(),
        })
    }

    /// Remote store base URL (for the HTTP remote transport).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if the remote URL is not set.
    pub fn require_remote_url(&self) -> Result<&str, ConfigError> {
        self.remote_url.as_deref().ok_or_else(|| ConfigError::Missing {
            field: "remote_url".into(),
            hint: "Set CRMSYNC_REMOTE_URL environment variable".into(),
        })
    }
}
