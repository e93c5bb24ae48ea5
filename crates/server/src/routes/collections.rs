//! CRUD over the mirrored collections.
//!
//! `PUT` and `DELETE` honor an optional `X-Sync-Token` header: with it the
//! write only applies when newer than the stored row, and deletes leave a
//! tombstone that blocks older writes. `POST` without a body `id` uses the
//! `Idempotency-Key` header as the row id when given, so a retried create
//! lands on the same row.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use crmsync_core::model::document_from_value;
use crmsync_core::store::generate_id;
use crmsync_core::{Collection, Document, OrderingToken};
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::handler::AppState;

pub const SYNC_TOKEN_HEADER: &str = "x-sync-token";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

fn collection(name: &str) -> Result<Collection, ApiError> {
    name.parse().map_err(|_| ApiError::NotFound(format!("unknown collection: {name}")))
}

fn sync_token(headers: &HeaderMap) -> Result<Option<OrderingToken>, ApiError> {
    let Some(value) = headers.get(SYNC_TOKEN_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|token| Some(OrderingToken(token)))
        .ok_or_else(|| ApiError::InvalidInput(format!("{SYNC_TOKEN_HEADER} must be an unsigned integer")))
}

fn idempotency_key(headers: &HeaderMap) -> Result<Option<String>, ApiError> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };
    match value.to_str().map(str::trim) {
        Ok(key) if !key.is_empty() => Ok(Some(key.to_string())),
        _ => Err(ApiError::InvalidInput(format!("{IDEMPOTENCY_KEY_HEADER} must be non-empty text"))),
    }
}

/// `POST /api/{collection}`: create or replace.
///
/// The row id is the body's `id`, else the `Idempotency-Key` header, else a
/// fresh id. Only the first two make a retried request idempotent; a request
/// with neither creates a new row each time it is sent.
pub async fn create(
    State(state): State<AppState>, Path(name): Path<String>, headers: HeaderMap, Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let collection = collection(&name)?;
    let key = idempotency_key(&headers)?;
    let document = document_from_value(body)?;
    let id = match document.get("id").and_then(Value::as_str).filter(|id| !id.trim().is_empty()) {
        Some(id) => id.to_string(),
        None => key.unwrap_or_else(generate_id),
    };

    state.db.upsert(collection, &id, &document, None).await?;
    tracing::debug!(%collection, %id, "row created");
    Ok(Json(json!({ "id": id })))
}

/// `GET /api/{collection}`: live rows, newest first.
pub async fn list(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<Vec<Document>>, ApiError> {
    let collection = collection(&name)?;
    Ok(Json(state.db.list(collection).await?))
}

/// `PUT /api/{collection}/{id}`: replace every field of the row.
pub async fn replace(
    State(state): State<AppState>, Path((name, id)): Path<(String, String)>, headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let collection = collection(&name)?;
    let token = sync_token(&headers)?;
    let document = document_from_value(body)?;

    let updated = state.db.upsert(collection, &id, &document, token).await?;
    if !updated {
        tracing::debug!(%collection, %id, ?token, "stale write ignored");
    }
    Ok(Json(json!({ "updated": u64::from(updated) })))
}

/// `DELETE /api/{collection}/{id}`
pub async fn remove(
    State(state): State<AppState>, Path((name, id)): Path<(String, String)>, headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let collection = collection(&name)?;
    let token = sync_token(&headers)?;

    let deleted = state.db.delete(collection, &id, token).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

#[cfg(test)]
mod tests {
    use crate::handler::router;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use crmsync_core::MirrorDb;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    async fn call(
        app: &axum::Router, method: Method, uri: &str, token: Option<u64>, body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header(super::SYNC_TOKEN_HEADER, token.to_string());
        }
        let request = match body {
            Some(body) => request.header("content-type", "application/json").body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, value)
    }

    async fn app() -> axum::Router {
        router(MirrorDb::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let app = app().await;
        let (status, body) = call(&app, Method::GET, "/api/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_lists_newest_first() {
        let app = app().await;
        let (status, created) = call(
            &app,
            Method::POST,
            "/api/clients",
            None,
            Some(json!({"name": "Alice", "createdAt": "2024-01-01T00:00:00Z"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!created["id"].as_str().unwrap().is_empty());

        call(
            &app,
            Method::POST,
            "/api/clients",
            None,
            Some(json!({"id": "c2", "name": "Bob", "createdAt": "2024-02-01T00:00:00Z"})),
        )
        .await;

        let (_, rows) = call(&app, Method::GET, "/api/clients", None, None).await;
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], "c2");
        assert_eq!(rows[1]["name"], "Alice");
    }

    #[tokio::test]
    async fn test_retried_create_with_idempotency_key() {
        let app = app().await;
        let send = |key: &'static str| {
            let request = Request::builder()
                .method(Method::POST)
                .uri("/api/clients")
                .header("content-type", "application/json")
                .header(super::IDEMPOTENCY_KEY_HEADER, key)
                .body(Body::from(json!({"name": "Alice", "email": ""}).to_string()))
                .unwrap();
            app.clone().oneshot(request)
        };

        for _ in 0..2 {
            let response = send("req-1").await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let body: Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(body["id"], "req-1");
        }
        assert_eq!(send("  ").await.unwrap().status(), StatusCode::BAD_REQUEST);

        let (_, rows) = call(&app, Method::GET, "/api/clients", None, None).await;
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["email"], Value::Null);
    }

    #[tokio::test]
    async fn test_versioned_put_and_delete() {
        let app = app().await;
        let (_, body) = call(&app, Method::PUT, "/api/cases/k1", Some(5), Some(json!({"amount": 40}))).await;
        assert_eq!(body, json!({"updated": 1}));

        let (_, body) = call(&app, Method::PUT, "/api/cases/k1", Some(4), Some(json!({"amount": 10}))).await;
        assert_eq!(body, json!({"updated": 0}));

        let (_, body) = call(&app, Method::DELETE, "/api/cases/k1", Some(6), None).await;
        assert_eq!(body, json!({"deleted": 1}));

        call(&app, Method::PUT, "/api/cases/k1", Some(5), Some(json!({"amount": 99}))).await;
        let (_, rows) = call(&app, Method::GET, "/api/cases", None, None).await;
        assert_eq!(rows, json!([]));
    }

    #[tokio::test]
    async fn test_unknown_collection_and_bad_token() {
        let app = app().await;
        let (status, body) = call(&app, Method::GET, "/api/appointments", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().starts_with("NOT_FOUND"));

        let request = Request::builder()
            .method(Method::DELETE)
            .uri("/api/users/u1")
            .header(super::SYNC_TOKEN_HEADER, "soon")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unversioned_delete_of_missing_row() {
        let app = app().await;
        let (status, body) = call(&app, Method::DELETE, "/api/users/nobody", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"deleted": 0}));
    }
}
