//! Liveness endpoint
//!
//! A small axum server answering every path with `200 OK`, meant for
//! orchestrator probes.

pub mod handlers;
pub mod routes;
pub mod server;

pub use server::HealthServer;
