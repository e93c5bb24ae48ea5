//! Mirror API client.
//!
//! Talks to the `crm-mirror` server:
//!
//! - `POST   /api/{collection}` creates a row, answering `{"id": ...}`
//! - `GET    /api/{collection}` lists rows, newest first
//! - `PUT    /api/{collection}/{id}` upserts a row
//! - `DELETE /api/{collection}/{id}` tombstones a row
//!
//! Versioned writes carry the ordering token in the `X-Sync-Token` header.

use std::time::Duration;

use async_trait::async_trait;
use crmsync_core::{AppConfig, Collection, Document, OrderingToken};
use reqwest::{Client, RequestBuilder, Response, header};
use serde::Deserialize;
use url::Url;

use super::{MirrorError, MirrorSink};

/// Header carrying the ordering token of a replicated change.
pub const SYNC_TOKEN_HEADER: &str = "x-sync-token";

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: String,
}

#[derive(Debug, Clone)]
pub struct MirrorClient {
    http: Client,
    base: Url,
}

impl MirrorClient {
    pub fn new(base_url: &str, timeout: Duration, user_agent: &str) -> Result<Self, MirrorError> {
        let base = Url::parse(base_url).map_err(|e| MirrorError::Parse(format!("invalid mirror url: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(MirrorError::Parse(format!("invalid mirror url: {base_url}")));
        }

        let http = Client::builder().user_agent(user_agent).timeout(timeout).use_rustls_tls().build()?;
        Ok(Self { http, base })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, MirrorError> {
        let base = config.require_mirror_url().map_err(|e| MirrorError::Parse(e.to_string()))?;
        Self::new(base, config.timeout(), &config.user_agent)
    }

    fn endpoint(&self, collection: Collection, id: Option<&str>) -> Result<Url, MirrorError> {
        let mut url = self.base.clone();
        {
            let mut segments =
                url.path_segments_mut().map_err(|()| MirrorError::Parse("mirror url cannot be a base".into()))?;
            segments.pop_if_empty().extend(["api", collection.as_str()]);
            if let Some(id) = id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    fn versioned(request: RequestBuilder, token: Option<OrderingToken>) -> RequestBuilder {
        match token {
            Some(token) => request.header(SYNC_TOKEN_HEADER, token.to_string()),
            None => request,
        }
    }

    async fn check(response: Response) -> Result<Response, MirrorError> {
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(MirrorError::HttpError { status: status.as_u16() });
        }
        Ok(response)
    }

    /// Create a row; the server assigns an id when the document has none.
    pub async fn create(&self, collection: Collection, document: &Document) -> Result<String, MirrorError> {
        let response = self.http.post(self.endpoint(collection, None)?).json(document).send().await?;
        let bytes = Self::check(response).await?.bytes().await?;
        let created: CreatedResponse = serde_json::from_slice(&bytes).map_err(|e| MirrorError::Parse(e.to_string()))?;
        Ok(created.id)
    }

    pub async fn list(&self, collection: Collection) -> Result<Vec<Document>, MirrorError> {
        let response = self
            .http
            .get(self.endpoint(collection, None)?)
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;
        let bytes = Self::check(response).await?.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| MirrorError::Parse(e.to_string()))
    }
}

#[async_trait]
impl MirrorSink for MirrorClient {
    async fn upsert(
        &self, collection: Collection, id: &str, document: &Document, token: Option<OrderingToken>,
    ) -> Result<(), MirrorError> {
        let request = self.http.put(self.endpoint(collection, Some(id))?).json(document);
        Self::check(Self::versioned(request, token).send().await?).await?;
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str, token: Option<OrderingToken>) -> Result<(), MirrorError> {
        let request = self.http.delete(self.endpoint(collection, Some(id))?);
        Self::check(Self::versioned(request, token).send().await?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, put};
    use axum::{Json, Router};
    use serde_json::{Value, json};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}")
    }

    fn client(base: &str) -> MirrorClient {
        MirrorClient::new(base, Duration::from_secs(5), "crmsync-test").unwrap()
    }

    #[tokio::test]
    async fn test_upsert_sends_token_header() {
        let router = Router::new().route(
            "/api/clients/{id}",
            put(|Path(id): Path<String>, headers: HeaderMap, Json(body): Json<Value>| async move {
                let token = headers.get(SYNC_TOKEN_HEADER).and_then(|v| v.to_str().ok()).unwrap_or_default();
                if id == "c1" && token == "7" && body["name"] == "Alice" {
                    StatusCode::OK
                } else {
                    StatusCode::BAD_REQUEST
                }
            }),
        );
        let base = serve(router).await;

        let document = crmsync_core::model::document_from_value(json!({"name": "Alice"})).unwrap();
        client(&base).upsert(Collection::Clients, "c1", &document, Some(OrderingToken(7))).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let router = Router::new().route(
            "/api/cases/{id}",
            put(|| async { StatusCode::INTERNAL_SERVER_ERROR }).delete(|| async { StatusCode::NOT_FOUND }),
        );
        let base = serve(router).await;
        let mirror = client(&base);

        let err = mirror.upsert(Collection::Cases, "k1", &Document::new(), None).await.unwrap_err();
        assert!(err.is_retryable());

        let err = mirror.delete(Collection::Cases, "k1", None).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_list_and_create() {
        let router = Router::new().route(
            "/api/users",
            get(|| async { Json(json!([{"id": "u1", "email": "a@x"}])) })
                .post(|Json(_): Json<Value>| async { (StatusCode::CREATED, Json(json!({"id": "u2"}))) }),
        );
        let base = serve(router).await;
        let mirror = client(&base);

        let rows = mirror.list(Collection::Users).await.unwrap();
        assert_eq!(rows[0]["id"], "u1");
        assert_eq!(mirror.create(Collection::Users, &Document::new()).await.unwrap(), "u2");
    }
}
