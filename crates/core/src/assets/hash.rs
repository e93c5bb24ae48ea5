//! Content-addressed keys for cached assets.

use sha2::{Digest, Sha256};

/// Storage key for `url` within cache `version`.
pub fn compute_asset_key(version: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version.as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 digest of an asset body, hex encoded.
pub fn content_digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_stability() {
        assert_eq!(compute_asset_key("v1", "/app.js"), compute_asset_key("v1", "/app.js"));
    }

    #[test]
    fn test_key_differs_by_version() {
        assert_ne!(compute_asset_key("v1", "/app.js"), compute_asset_key("v2", "/app.js"));
    }

    #[test]
    fn test_key_format() {
        let key = compute_asset_key("notary-crm-v1", "/index.html");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_content_digest_known_value() {
        assert_eq!(content_digest(b""), "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    }
}
