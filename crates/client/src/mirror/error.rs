//! Mirror writer error types.

use std::sync::Arc;

/// Errors writing to the relational mirror.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MirrorError {
    /// Network error reaching the mirror API.
    #[error("MIRROR_NETWORK: {0}")]
    Network(Arc<str>),

    /// Request timeout.
    #[error("MIRROR_TIMEOUT: request timed out")]
    Timeout,

    /// HTTP error response.
    #[error("MIRROR_HTTP: status {status}")]
    HttpError { status: u16 },

    /// Response parse error.
    #[error("MIRROR_PARSE: {0}")]
    Parse(String),

    /// Mirror database failure.
    #[error(transparent)]
    Storage(Arc<crmsync_core::Error>),
}

impl MirrorError {
    /// Whether the write should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            MirrorError::Network(_) | MirrorError::Timeout => true,
            MirrorError::HttpError { status } => *status == 429 || *status >= 500,
            MirrorError::Storage(e) => e.is_transient(),
            MirrorError::Parse(_) => false,
        }
    }
}

impl From<reqwest::Error> for MirrorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() { MirrorError::Timeout } else { MirrorError::Network(err.to_string().into()) }
    }
}

impl From<crmsync_core::Error> for MirrorError {
    fn from(err: crmsync_core::Error) -> Self {
        MirrorError::Storage(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(MirrorError::Timeout.is_retryable());
        assert!(MirrorError::HttpError { status: 502 }.is_retryable());
        assert!(MirrorError::HttpError { status: 429 }.is_retryable());
        assert!(!MirrorError::HttpError { status: 404 }.is_retryable());
        assert!(!MirrorError::from(crmsync_core::Error::InvalidInput("x".into())).is_retryable());
    }
}
