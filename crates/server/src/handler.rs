//! Router and shared state for the mirror API.

use axum::Router;
use axum::routing::{get, put};
use crmsync_core::MirrorDb;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::routes::{collections, health};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: MirrorDb,
}

/// Build the API router.
pub fn router(db: MirrorDb) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/{collection}", get(collections::list).post(collections::create))
        .route("/api/{collection}/{id}", put(collections::replace).delete(collections::remove))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { db })
}
