//! Liveness server using Axum

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::error::{Result, VillipError};

use super::routes;

/// Liveness server
pub struct HealthServer {
    addr: String,
}

impl HealthServer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Build the router
    fn build_router(&self) -> Router {
        routes::create_router().layer(TraceLayer::new_for_http())
    }

    /// Run the liveness server
    #[instrument(skip(self, shutdown), fields(addr = %self.addr))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("Health server listening on {}", self.addr);
        self.serve(listener, shutdown).await
    }

    /// Serve from an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| VillipError::Internal(e.to_string()))?;

        info!("Health server shut down");
        Ok(())
    }
}
