//! Asset cache error types.

/// Errors installing or serving cached assets.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    /// The URL could not be resolved against the asset origin.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// Network error fetching an asset.
    #[error("ASSET_FETCH: {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// The asset server answered with a non-success status.
    #[error("ASSET_HTTP: {url}: status {status}")]
    HttpStatus { url: String, status: u16 },

    /// The asset body exceeded the configured size limit.
    #[error("ASSET_TOO_LARGE: {url}: {size} bytes exceeds {limit}")]
    TooLarge { url: String, size: u64, limit: u64 },

    /// Local store failure.
    #[error(transparent)]
    Cache(#[from] crmsync_core::Error),
}
