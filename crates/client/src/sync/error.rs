//! Remote sync error types.

use std::sync::Arc;

/// Errors from the remote store and the sync client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Network error talking to the remote store.
    #[error("SYNC_NETWORK: {0}")]
    Network(Arc<str>),

    /// Request timeout.
    #[error("SYNC_TIMEOUT: request timed out")]
    Timeout,

    /// Remote store temporarily unavailable (5xx, 429).
    #[error("SYNC_UNAVAILABLE: {0}")]
    Unavailable(String),

    /// Authentication or authorization refused.
    #[error("SYNC_PERMISSION_DENIED: {0}")]
    PermissionDenied(String),

    /// The remote store refused the write outright.
    #[error("SYNC_REJECTED: {0}")]
    Rejected(String),

    /// Response body could not be parsed.
    #[error("SYNC_PARSE: {0}")]
    Parse(String),

    /// Local store failure.
    #[error(transparent)]
    Cache(Arc<crmsync_core::Error>),
}

impl SyncError {
    /// Whether retrying with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Network(_) | SyncError::Timeout | SyncError::Unavailable(_) => true,
            SyncError::Cache(e) => e.is_transient(),
            SyncError::PermissionDenied(_) | SyncError::Rejected(_) | SyncError::Parse(_) => false,
        }
    }

    /// Whether the local store refused a write for lack of quota.
    pub fn is_cache_full(&self) -> bool {
        matches!(self, SyncError::Cache(e) if matches!(e.as_ref(), crmsync_core::Error::CacheFull { .. }))
    }

    /// Map an HTTP status from the remote store.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => SyncError::PermissionDenied(format!("status {status}")),
            429 | 500..=599 => SyncError::Unavailable(format!("status {status}")),
            _ => SyncError::Rejected(format!("status {status}: {body}")),
        }
    }
}

impl From<crmsync_core::Error> for SyncError {
    fn from(err: crmsync_core::Error) -> Self {
        SyncError::Cache(Arc::new(err))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() { SyncError::Timeout } else { SyncError::Network(err.to_string().into()) }
    }
}
