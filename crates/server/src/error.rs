//! Structured errors for the mirror API.
//!
//! Every error renders as `{"error": "<CODE>: <message>"}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unknown collection.
    #[error("NOT_FOUND: {0}")]
    NotFound(String),

    /// Malformed body, identifier or sync token.
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Mirror database failure.
    #[error(transparent)]
    Storage(crmsync_core::Error),
}

impl From<crmsync_core::Error> for ApiError {
    fn from(err: crmsync_core::Error) -> Self {
        match err {
            crmsync_core::Error::InvalidInput(msg) => ApiError::InvalidInput(msg),
            other => ApiError::Storage(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Storage(e) => {
                tracing::error!(error = %e, "mirror storage failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::NotFound("x".into()).into_response().status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::from(crmsync_core::Error::InvalidInput("bad".into())).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(crmsync_core::Error::MigrationFailed("x".into())).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
