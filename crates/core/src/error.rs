//! Unified error types for the sync core.
//!
//! Messages carry a stable code prefix so operational logs can be grepped
//! without parsing the variant.

use tokio_rusqlite::rusqlite;

/// Unified error type for local storage, leasing and mirror storage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (unknown collection, empty identifier, non-object document).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Local storage quota exhausted. The write was refused, not dropped.
    #[error("CACHE_FULL: {needed} bytes needed, {available} bytes available")]
    CacheFull { needed: u64, available: u64 },

    /// Another tab won the lease compare-and-swap. Never surfaced to users.
    #[error("LEASE_CONFLICT: {0}")]
    LeaseConflict(String),

    /// No cached asset for the given URL in the active version.
    #[error("ASSET_MISS: {0}")]
    AssetMiss(String),

    /// Database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("CACHE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// Stored or supplied JSON could not be (de)serialized.
    #[error("SERIALIZATION: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether retrying the same operation may succeed.
    ///
    /// Busy/locked databases are transient across tabs; quota and input errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(tokio_rusqlite::Error::Error(rusqlite::Error::SqliteFailure(e, _))) => {
                matches!(e.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            }
            Error::LeaseConflict(_) => true,
            _ => false,
        }
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
