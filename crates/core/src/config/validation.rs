//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `heartbeat_ms` is 0 or `lease_timeout_ms` does not exceed it
    /// - `backoff_base_ms` is 0 or `backoff_cap_ms` is below it
    /// - `cache_quota_bytes`, `change_log_retention` or `write_attempts` is 0
    /// - `timeout_ms` is less than 100ms or exceeds 5 minutes
    /// - `user_agent` is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_ms == 0 {
            return Err(ConfigError::Invalid { field: "heartbeat_ms".into(), reason: "must be greater than 0".into() });
        }
        if self.lease_timeout_ms <= self.heartbeat_ms {
            return Err(ConfigError::Invalid {
                field: "lease_timeout_ms".into(),
                reason: format!("must exceed heartbeat_ms ({})", self.heartbeat_ms),
            });
        }
        if self.lease_timeout_ms < 2 * self.heartbeat_ms {
            tracing::warn!(
                heartbeat_ms = self.heartbeat_ms,
                lease_timeout_ms = self.lease_timeout_ms,
                "lease timeout leaves room for a single missed heartbeat; a slow tab may lose its lease"
            );
        }

        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "poll_interval_ms".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.backoff_base_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "backoff_base_ms".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid {
                field: "backoff_cap_ms".into(),
                reason: format!("must be at least backoff_base_ms ({})", self.backoff_base_ms),
            });
        }

        if self.write_attempts == 0 {
            return Err(ConfigError::Invalid { field: "write_attempts".into(), reason: "must be at least 1".into() });
        }

        if self.cache_quota_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "cache_quota_bytes".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.change_log_retention == 0 {
            return Err(ConfigError::Invalid {
                field: "change_log_retention".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.timeout_ms < 100 {
            return Err(ConfigError::Invalid { field: "timeout_ms".into(), reason: "must be at least 100ms".into() });
        }
        if self.timeout_ms > 300_000 {
            return Err(ConfigError::Invalid {
                field: "timeout_ms".into(),
                reason: "must not exceed 5 minutes (300000ms)".into(),
            });
        }

        if self.user_agent.is_empty() {
            return Err(ConfigError::Invalid { field: "user_agent".into(), reason: "must not be empty".into() });
        }

        Ok(())
    }
}
