//! Versioned static asset cache.
//!
//! A manifest names a cache version and the URLs in it. A version is staged
//! whole (every asset or none) and only becomes visible once activated;
//! activation deletes every other version.

pub mod hash;
mod storage;

use serde::{Deserialize, Serialize};

pub use storage::{AssetVersion, CachedAsset};

/// Cache version of the bundled application shell.
///
/// Bump this whenever any shell asset changes; installed clients keep serving
/// the old bytes until a new version is installed and activated.
pub const SHELL_CACHE_VERSION: &str = "notary-crm-v1";

const SHELL_ASSETS: &[&str] = &[
    "/",
    "/index.html",
    "/styles.css",
    "/app.js",
    "/booking.html",
    "/status.html",
    "/landing.html",
    "/manifest.json",
    "/image/icon-192.png",
    "/image/icon-512.png",
    "/image/notary-photo.png",
    "https://cdn.jsdelivr.net/npm/chart.js",
    "https://cdn.jsdelivr.net/npm/fullcalendar@6.1.10/index.global.min.js",
    "https://cdn.jsdelivr.net/npm/@emailjs/browser@3/dist/email.min.js",
];

/// A named, immutable set of asset URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest {
    pub version: String,
    /// Absolute URLs or paths relative to the asset origin.
    pub urls: Vec<String>,
}

impl AssetManifest {
    pub fn new(version: impl Into<String>, urls: Vec<String>) -> Self {
        Self { version: version.into(), urls }
    }

    /// The application shell: pages, styles, icons and third-party scripts.
    pub fn shell() -> Self {
        Self::new(SHELL_CACHE_VERSION, SHELL_ASSETS.iter().map(|url| (*url).to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_manifest() {
        let manifest = AssetManifest::shell();
        assert_eq!(manifest.version, "notary-crm-v1");
        assert_eq!(manifest.urls.len(), 14);
        assert!(manifest.urls.iter().any(|u| u == "/index.html"));
    }

    #[test]
    fn test_manifest_deserialize() {
        let manifest: AssetManifest = serde_json::from_str(r#"{"version": "v2", "urls": ["/a.js"]}"#).unwrap();
        assert_eq!(manifest, AssetManifest::new("v2", vec!["/a.js".into()]));
    }
}
