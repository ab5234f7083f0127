//! Raw TCP splicing
//!
//! Every client connection gets its own backend connection; bytes are copied
//! both ways untouched and the pair is torn down as soon as either direction
//! ends.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use super::dispatcher::Dispatcher;
use super::transport::CONNECT_TIMEOUT;
use super::ProxyListener;
use crate::error::{Result, VillipError};

/// Side whose copy ended first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closer {
    Client,
    Backend,
}

/// Copy data both ways until one direction terminates.
///
/// Returns the side that stopped sending and the bytes it had sent.
pub async fn splice<C, S>(client: C, backend: S) -> (Closer, std::io::Result<u64>)
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    tokio::select! {
        sent = tokio::io::copy(&mut client_read, &mut backend_write) => (Closer::Client, sent),
        received = tokio::io::copy(&mut backend_read, &mut client_write) => (Closer::Backend, received),
    }
}

/// TCP server of one port, bound to exactly one rule
pub struct TcpServer {
    host: String,
    port: u16,
    backend: String,
}

impl TcpServer {
    pub fn new(host: impl Into<String>, port: u16, backend: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            backend: backend.into(),
        }
    }

    pub fn from_dispatcher(host: &str, dispatcher: &Dispatcher) -> Result<Self> {
        let rule = dispatcher.rules().first().ok_or_else(|| {
            VillipError::Internal(format!("no rule for TCP port {}", dispatcher.port()))
        })?;
        Ok(Self::new(host, dispatcher.port(), rule.tcp_address()))
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let backend = self.backend.clone();
                            tokio::spawn(async move {
                                debug!(source = %client_addr, backend = %backend, "new TCP connection");
                                Self::forward(stream, &backend).await;
                            });
                        }
                        Err(e) => {
                            error!(port = self.port, "Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(port = self.port, "TCP server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn forward(client: TcpStream, backend: &str) {
        let upstream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(backend)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!(backend = %backend, "Dial failed: {}", e);
                return;
            }
            Err(_) => {
                error!(backend = %backend, "Dial timed out");
                return;
            }
        };

        let (closer, result) = splice(client, upstream).await;
        match result {
            Ok(bytes) => debug!(closer = ?closer, bytes, "TCP connection closed"),
            Err(e) => debug!(closer = ?closer, "TCP copy ended: {}", e),
        }
    }
}

#[async_trait]
impl ProxyListener for TcpServer {
    fn port(&self) -> u16 {
        self.port
    }

    #[instrument(skip(self, shutdown), fields(port = self.port))]
    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(backend = %self.backend, "TCP server listening on {}", addr);
        self.serve(listener, shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::build_dispatchers;
    use crate::rule::Rule;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Duration;
    use url::Url;

    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_splice_ends_when_backend_closes() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (backend, mut backend_peer) = tokio::io::duplex(1024);

        let handle = tokio::spawn(async move { splice(client, backend).await });

        backend_peer.write_all(b"hello from backend").await.unwrap();
        backend_peer.shutdown().await.unwrap();

        let mut buf = vec![0u8; 100];
        let n = client_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from backend");

        let (closer, result) = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("splice did not stop")
            .unwrap();
        assert_eq!(closer, Closer::Backend);
        assert_eq!(tokio_test::assert_ok!(result), 18);
    }

    #[tokio::test]
    async fn test_splice_ends_when_client_closes() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (backend, _backend_peer) = tokio::io::duplex(1024);

        let handle = tokio::spawn(async move { splice(client, backend).await });
        client_peer.shutdown().await.unwrap();

        let (closer, _) = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("splice did not stop")
            .unwrap();
        assert_eq!(closer, Closer::Client);
    }

    #[tokio::test]
    async fn test_echo_through_proxy() {
        let echo = spawn_echo().await;
        let server = TcpServer::new("127.0.0.1", 0, echo.to_string());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(async move { server.serve(listener, rx).await });

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(&payload).await.unwrap();

        let mut received = vec![0u8; payload.len()];
        tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut received))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_dial_failure_drops_client() {
        let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let backend = unused.local_addr().unwrap();
        drop(unused);

        let server = TcpServer::new("127.0.0.1", 0, backend.to_string());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(async move { server.serve(listener, rx).await });

        let mut stream = TcpStream::connect(proxy).await.unwrap();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("connection was not dropped")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_backend_from_rule() {
        let dispatchers =
            build_dispatchers(vec![Rule::tcp(Url::parse("tcp://backend:9000").unwrap(), 9000)]).unwrap();
        let server = TcpServer::from_dispatcher("0.0.0.0", &dispatchers[0]).unwrap();
        assert_eq!(server.backend(), "backend:9000");
        assert_eq!(server.port(), 9000);
    }
}
