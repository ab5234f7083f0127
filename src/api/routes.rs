//! API route definitions

use axum::routing::get;
use axum::Router;

use super::handlers;

/// Create the liveness router; unknown paths answer like `/`
pub fn create_router() -> Router {
    Router::new()
        .route("/", get(handlers::health::health_check))
        .fallback(handlers::health::health_check)
}
