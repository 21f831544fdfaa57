mod error;
mod handlers;
mod sse;

pub use error::AppError;

use crate::events::EventBroadcaster;
use crate::files::FileCatalog;
use crate::uploader::UploadService;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub uploads: UploadService,
    pub files: FileCatalog,
    pub events: EventBroadcaster,
    /// Largest accepted chunk request body
    pub max_chunk_bytes: usize,
}

/// Standard API response
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    tracing::debug!(target: "api", "Creating API router");

    let chunk_limit = state.max_chunk_bytes;
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Chunked uploads
        .route(
            "/api/upload/chunk",
            post(handlers::upload_chunk).layer(DefaultBodyLimit::max(chunk_limit)),
        )
        // Byte proxies
        .route("/api/upload/proxy", put(handlers::upload_proxy).post(handlers::upload_proxy))
        .route("/api/download/proxy", get(handlers::download_proxy))
        // Server-Sent Events for progress updates
        .route("/api/events", get(sse::sse_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
