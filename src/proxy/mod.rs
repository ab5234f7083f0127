//! Proxy listeners
//!
//! This module provides:
//! - Per-port rule dispatch
//! - The HTTP exchange pipeline (request and response phases)
//! - Raw TCP splicing

pub mod dispatcher;
pub mod exchange;
pub mod handler;
pub mod request;
pub mod response;
pub mod server;
pub mod transport;
pub mod tunnel;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::{Result, VillipError};
use crate::rule::Kind;

pub use dispatcher::{build_dispatchers, Dispatcher, DispatcherBuilder};
pub use exchange::ExchangeContext;
pub use handler::FilterHandler;
pub use server::HttpServer;
pub use transport::BackendClients;
pub use tunnel::TcpServer;

/// Channel on which listeners report errors that must stop the process
pub type FatalSender = mpsc::UnboundedSender<VillipError>;

/// A server bound to one configured port
#[async_trait]
pub trait ProxyListener: Send + Sync {
    /// Port the listener binds
    fn port(&self) -> u16;

    /// Accept connections until `shutdown` flips to true
    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()>;
}

/// Create one listener per dispatcher
pub fn create_listeners(
    host: &str,
    dispatchers: Vec<Dispatcher>,
    fatal: FatalSender,
) -> Result<Vec<Arc<dyn ProxyListener>>> {
    let clients = BackendClients::new()?;
    let handler = FilterHandler::new(clients);

    let mut listeners: Vec<Arc<dyn ProxyListener>> = Vec::with_capacity(dispatchers.len());
    for dispatcher in dispatchers {
        let listener: Arc<dyn ProxyListener> = match dispatcher.kind() {
            Kind::Http => Arc::new(HttpServer::new(
                host,
                dispatcher,
                handler.clone(),
                fatal.clone(),
            )),
            Kind::Tcp => Arc::new(TcpServer::from_dispatcher(host, &dispatcher)?),
        };
        listeners.push(listener);
    }
    Ok(listeners)
}
