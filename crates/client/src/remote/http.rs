//! Remote store over HTTP.
//!
//! Endpoints, relative to the base URL:
//!
//! - `PUT    /v1/{collection}/{id}` with the document body, answers `{"token": n}`
//! - `DELETE /v1/{collection}/{id}`, answers `{"token": n}`
//! - `GET    /v1/{collection}/changes?since=&wait_ms=&owner_id=`, a long poll
//!   answering `{"changes": [ChangeRecord, ...]}`

use std::time::Duration;

use async_trait::async_trait;
use crmsync_core::{AppConfig, ChangeRecord, Collection, Document, OrderingToken};
use reqwest::{Client, header};
use serde::Deserialize;
use url::Url;

use super::{ChangeFilter, RemoteStore};
use crate::sync::SyncError;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: OrderingToken,
}

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    changes: Vec<ChangeRecord>,
}

/// HTTP transport for [`RemoteStore`].
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    http: Client,
    base: Url,
    timeout: Duration,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, timeout: Duration, user_agent: &str) -> Result<Self, SyncError> {
        let base = Url::parse(base_url).map_err(|e| SyncError::Rejected(format!("invalid remote url: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(SyncError::Rejected(format!("invalid remote url: {base_url}")));
        }

        let http = Client::builder()
            .user_agent(user_agent)
            .use_rustls_tls()
            .gzip(true)
            .build()
            .map_err(SyncError::from)?;

        Ok(Self { http, base, timeout })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, SyncError> {
        let base = config.require_remote_url().map_err(|e| SyncError::Rejected(e.to_string()))?;
        Self::new(base, config.timeout(), &config.user_agent)
    }

    fn endpoint(&self, collection: Collection, tail: &str) -> Result<Url, SyncError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| SyncError::Rejected("remote url cannot be a base".into()))?
            .pop_if_empty()
            .extend(["v1", collection.as_str(), tail]);
        Ok(url)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, SyncError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status.as_u16(), &body));
        }
        let bytes = response.bytes().await.map_err(SyncError::from)?;
        serde_json::from_slice(&bytes).map_err(|e| SyncError::Parse(e.to_string()))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn write(&self, collection: Collection, id: &str, document: &Document) -> Result<OrderingToken, SyncError> {
        let url = self.endpoint(collection, id)?;
        tracing::debug!(%collection, id, "remote write");

        let response = self
            .http
            .put(url)
            .timeout(self.timeout)
            .header(header::ACCEPT, "application/json")
            .json(document)
            .send()
            .await?;
        Ok(Self::read_json::<TokenResponse>(response).await?.token)
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<OrderingToken, SyncError> {
        let url = self.endpoint(collection, id)?;
        tracing::debug!(%collection, id, "remote delete");

        let response =
            self.http.delete(url).timeout(self.timeout).header(header::ACCEPT, "application/json").send().await?;
        Ok(Self::read_json::<TokenResponse>(response).await?.token)
    }

    async fn changes_since(
        &self, collection: Collection, since: OrderingToken, filter: &ChangeFilter, wait: Duration,
    ) -> Result<Vec<ChangeRecord>, SyncError> {
        let mut url = self.endpoint(collection, "changes")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("since", &since.to_string());
            query.append_pair("wait_ms", &wait.as_millis().to_string());
            if let Some(owner) = &filter.owner_id {
                query.append_pair("owner_id", owner);
            }
        }

        let response = self
            .http
            .get(url)
            .timeout(self.timeout + wait)
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;
        let mut changes = Self::read_json::<ChangesResponse>(response).await?.changes;
        changes.retain(|record| record.collection == collection);
        changes.sort_by_key(|record| record.token);
        Ok(changes)
    }
}
