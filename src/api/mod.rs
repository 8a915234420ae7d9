//! API layer -- axum routes, handlers, and error mapping.

mod routes;
pub mod state;

use self::state::AppState;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;

use crate::ingest::IngestError;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .with_state(state)
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

/// Handler failure, rendered as `{ "error": { "code", "message" } }`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Ingest(IngestError),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        ApiError::Ingest(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Ingest(IngestError::DuplicateRun { run_id }) => {
                // Idempotent resubmission is a success for the caller.
                let body = json!({
                    "data": { "run_id": run_id, "duplicate": true },
                    "meta": { "version": env!("CARGO_PKG_VERSION") }
                });
                return (StatusCode::OK, Json(body)).into_response();
            }
            ApiError::Ingest(e) => {
                let (status, code) = match &e {
                    IngestError::ConflictingRun { .. } => (StatusCode::CONFLICT, "conflicting_run"),
                    IngestError::EmptyRun { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "empty_run"),
                    IngestError::InvalidRecord { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_record"),
                    IngestError::Cancelled { .. } => (StatusCode::REQUEST_TIMEOUT, "cancelled"),
                    IngestError::PartialIngestFailure { .. } => {
                        (StatusCode::SERVICE_UNAVAILABLE, "partial_ingest_failure")
                    }
                    IngestError::DuplicateRun { .. } => (StatusCode::OK, "duplicate_run"),
                };
                (status, code, e.to_string())
            }
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, "not_found", what),
            ApiError::BadRequest(why) => (StatusCode::BAD_REQUEST, "bad_request", why),
            ApiError::Internal(e) => {
                tracing::error!("request failed: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string())
            }
        };

        let body = json!({
            "error": { "code": code, "message": message },
            "meta": { "version": env!("CARGO_PKG_VERSION") }
        });
        (status, Json(body)).into_response()
    }
}
