//! Versioned offline asset cache.
//!
//! `install` stages a whole manifest or nothing, `activate` switches the
//! served version and drops the rest, and `fetch` answers from the active
//! version first, falling back to the network without caching the result.

mod error;

pub use error::AssetError;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use crmsync_core::{AppConfig, AssetManifest, CachedAsset, LocalStore};
use futures_util::future::try_join_all;
use reqwest::{Client, header};
use tracing::{debug, info};
use url::Url;

/// Default response size limit for a single asset.
const DEFAULT_MAX_BYTES: u64 = 5 * 1024 * 1024;

/// A successfully fetched asset body.
#[derive(Debug, Clone)]
pub struct FetchedAsset {
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Network side of the asset cache.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Fetch `url`. Non-success statuses are errors.
    async fn fetch(&self, url: &Url) -> Result<FetchedAsset, AssetError>;
}

/// reqwest-backed [`AssetFetcher`] with a body size limit.
#[derive(Debug, Clone)]
pub struct HttpAssetFetcher {
    http: Client,
    max_bytes: u64,
}

impl HttpAssetFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, AssetError> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| AssetError::Fetch {
                url: String::new(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http, max_bytes: DEFAULT_MAX_BYTES })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, AssetError> {
        Self::new(config.timeout(), &config.user_agent)
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    fn too_large(&self, url: &Url, size: u64) -> AssetError {
        AssetError::TooLarge { url: url.to_string(), size, limit: self.max_bytes }
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedAsset, AssetError> {
        let fetch_error = |e: reqwest::Error| AssetError::Fetch { url: url.to_string(), reason: e.to_string() };

        let response = self.http.get(url.clone()).send().await.map_err(fetch_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(AssetError::HttpStatus { url: url.to_string(), status: status.as_u16() });
        }

        if let Some(len) = response.content_length()
            && len > self.max_bytes
        {
            return Err(self.too_large(url, len));
        }

        let content_type =
            response.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(|s| s.to_string());
        let body = response.bytes().await.map_err(fetch_error)?;
        if body.len() as u64 > self.max_bytes {
            return Err(self.too_large(url, body.len() as u64));
        }

        debug!(%url, bytes = body.len(), "fetched asset");
        Ok(FetchedAsset { content_type, body })
    }
}

/// Where an asset response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetSource {
    Cache,
    Network,
}

#[derive(Debug, Clone)]
pub struct AssetResponse {
    pub url: String,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub source: AssetSource,
}

/// Cache-first asset access on top of the local store.
#[derive(Clone)]
pub struct AssetCache {
    store: LocalStore,
    fetcher: Arc<dyn AssetFetcher>,
    origin: Url,
}

impl std::fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetCache").field("origin", &self.origin.as_str()).finish_non_exhaustive()
    }
}

impl AssetCache {
    pub fn new(store: LocalStore, fetcher: Arc<dyn AssetFetcher>, origin: &str) -> Result<Self, AssetError> {
        let origin = Url::parse(origin).map_err(|e| AssetError::InvalidUrl(format!("{origin}: {e}")))?;
        Ok(Self { store, fetcher, origin })
    }

    pub fn from_config(store: LocalStore, config: &AppConfig) -> Result<Self, AssetError> {
        let fetcher = HttpAssetFetcher::from_config(config)?;
        Self::new(store, Arc::new(fetcher), &config.asset_origin)
    }

    /// Resolve a manifest entry against the asset origin.
    pub fn resolve(&self, url: &str) -> Result<Url, AssetError> {
        self.origin.join(url).map_err(|e| AssetError::InvalidUrl(format!("{url}: {e}")))
    }

    /// Fetch every manifest URL and store them as `manifest.version`.
    ///
    /// All fetches run concurrently; if any fails nothing is written and the
    /// active version keeps serving. Returns the number of assets stored.
    pub async fn install(&self, manifest: &AssetManifest) -> Result<usize, AssetError> {
        let urls = manifest.urls.iter().map(|url| self.resolve(url)).collect::<Result<Vec<_>, _>>()?;

        let fetched = try_join_all(urls.iter().map(|url| self.fetcher.fetch(url))).await?;
        let assets: Vec<CachedAsset> = urls
            .iter()
            .zip(fetched)
            .map(|(url, asset)| CachedAsset::new(url.as_str(), asset.content_type, asset.body.to_vec()))
            .collect();

        let count = assets.len();
        self.store.install_asset_version(&manifest.version, assets).await?;
        info!(version = %manifest.version, assets = count, "installed asset version");
        Ok(count)
    }

    /// Serve `version` from now on and delete every other version.
    pub async fn activate(&self, version: &str) -> Result<u64, AssetError> {
        let removed = self.store.activate_asset_version(version).await?;
        info!(version, removed, "activated asset version");
        Ok(removed)
    }

    /// Install then activate `manifest` unless it is already active.
    pub async fn ensure(&self, manifest: &AssetManifest) -> Result<(), AssetError> {
        if self.store.active_asset_version().await?.as_deref() == Some(manifest.version.as_str()) {
            return Ok(());
        }
        self.install(manifest).await?;
        self.activate(&manifest.version).await?;
        Ok(())
    }

    /// Answer from the active version, else from the network.
    ///
    /// Network responses are not written to the cache.
    pub async fn fetch(&self, url: &str) -> Result<AssetResponse, AssetError> {
        let url = self.resolve(url)?;
        if let Some(asset) = self.store.cached_asset(url.as_str()).await? {
            debug!(%url, "asset cache hit");
            return Ok(AssetResponse {
                url: asset.url,
                content_type: asset.content_type,
                body: Bytes::from(asset.body),
                source: AssetSource::Cache,
            });
        }

        debug!(%url, "asset cache miss");
        let fetched = self.fetcher.fetch(&url).await?;
        Ok(AssetResponse {
            url: url.into(),
            content_type: fetched.content_type,
            body: fetched.body,
            source: AssetSource::Network,
        })
    }
}
