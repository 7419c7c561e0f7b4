//! HTTP admin surface over the orchestrator and the realigner.

pub mod handlers;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::error::SyncError;
use crate::realign::Realigner;
use crate::sync::SyncOrchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub realigner: Arc<Realigner>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/runs", get(handlers::runs))
        .route("/sync/incremental", post(handlers::sync_incremental))
        .route("/sync/backfill", post(handlers::sync_backfill))
        .route(
            "/sync/schedule",
            post(handlers::enable_schedule).delete(handlers::disable_schedule),
        )
        .route("/realign", post(handlers::realign))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).into_inner())
        .with_state(state)
}

/// Error body returned by every handler.
pub struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::ValidationError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
