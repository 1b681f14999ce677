//! Health check endpoint.

use axum::http::StatusCode;
use axum::Json;
use llmhub_common::HealthResponse;

/// GET /health - liveness of the provider process.
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse::ok()))
}
