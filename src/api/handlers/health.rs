//! Health check endpoint

use axum::http::StatusCode;
use axum::response::IntoResponse;

/// Body of every liveness answer
pub const HEALTH_BODY: &str = "OK\n";

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, HEALTH_BODY)
}
