//! HTTP listener using hyper
//!
//! Accepts client connections on a rule port, picks the governing rule for
//! each request and hands the exchange to the filter handler.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::dispatcher::Dispatcher;
use super::handler::{error_response, FilterHandler};
use super::{FatalSender, ProxyListener};
use crate::error::{Result, VillipError};

/// Body sent when no rule of the port governs a request
pub const NO_FILTER_BODY: &str = "No filter correspond to this requests";

/// HTTP server of one port
pub struct HttpServer {
    host: String,
    dispatcher: Arc<Dispatcher>,
    handler: FilterHandler,
    fatal: FatalSender,
}

impl HttpServer {
    pub fn new(
        host: impl Into<String>,
        dispatcher: Dispatcher,
        handler: FilterHandler,
        fatal: FatalSender,
    ) -> Self {
        Self {
            host: host.into(),
            dispatcher: Arc::new(dispatcher),
            handler,
            fatal,
        }
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            let dispatcher = self.dispatcher.clone();
                            let handler = self.handler.clone();
                            let fatal = self.fatal.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, dispatcher, handler, fatal).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(port = self.dispatcher.port(), "HTTP server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection
    async fn handle_connection(
        stream: TcpStream,
        dispatcher: Arc<Dispatcher>,
        handler: FilterHandler,
        fatal: FatalSender,
    ) -> Result<()> {
        let remote = stream.peer_addr().ok();
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let dispatcher = dispatcher.clone();
            let handler = handler.clone();
            let fatal = fatal.clone();

            async move {
                Ok::<_, Infallible>(dispatch(&dispatcher, &handler, &fatal, req, remote).await)
            }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl ProxyListener for HttpServer {
    fn port(&self) -> u16 {
        self.dispatcher.port()
    }

    #[instrument(skip(self, shutdown), fields(port = self.dispatcher.port()))]
    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.dispatcher.port());
        let listener = TcpListener::bind(&addr).await?;
        info!(
            rules = self.dispatcher.rules().len(),
            "HTTP server listening on {}", addr
        );
        self.serve(listener, shutdown).await
    }
}

/// Route one request to the rule governing it
async fn dispatch(
    dispatcher: &Dispatcher,
    handler: &FilterHandler,
    fatal: &FatalSender,
    req: Request<Incoming>,
    remote: Option<SocketAddr>,
) -> Response<Full<Bytes>> {
    let Some(source) = remote.map(|addr| addr.ip().to_canonical()) else {
        error!(port = dispatcher.port(), "cannot read the remote address");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &VillipError::SourceIp.to_string(),
        );
    };

    let Some(rule) = dispatcher.select(source, req.headers()) else {
        return error_response(StatusCode::NOT_FOUND, NO_FILTER_BODY);
    };

    match handler.handle(&rule, req, source).await {
        Ok(response) => response,
        Err(e) => {
            let status = e.status_code();
            let message = e.to_string();
            if e.is_fatal() {
                error!(port = dispatcher.port(), error = %message, "fatal error");
                if fatal.send(e).is_err() {
                    warn!("nobody listens for fatal errors");
                }
            } else {
                warn!(port = dispatcher.port(), source = %source, error = %message, "exchange failed");
            }
            error_response(status, &message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::build_dispatchers;
    use crate::proxy::transport::BackendClients;
    use crate::rewrite::Replacement;
    use crate::rule::{Action, HttpFilter, Restrictions, Rule, TokenAction, TokenCondition};
    use http::header::HeaderName;
    use http_body_util::BodyExt;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use tokio::sync::mpsc;
    use url::Url;

    /// Start a backend answering every request with `body`
    async fn spawn_backend(body: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let service = service_fn(|_req: Request<Incoming>| async move {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .header("content-type", "text/html")
                                .body(Full::new(Bytes::from_static(body.as_bytes())))
                                .unwrap(),
                        )
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        addr
    }

    fn http_rule(backend: SocketAddr, priority: u8, restrictions: Restrictions, filter: HttpFilter) -> Rule {
        Rule::http(
            Url::parse(&format!("http://{}", backend)).unwrap(),
            8080,
            priority,
            restrictions,
            filter,
        )
    }

    async fn spawn_proxy(rules: Vec<Rule>) -> (SocketAddr, watch::Sender<bool>) {
        let mut dispatchers = build_dispatchers(rules).unwrap();
        let (fatal, _) = mpsc::unbounded_channel();
        let server = HttpServer::new(
            "127.0.0.1",
            dispatchers.remove(0),
            FilterHandler::new(BackendClients::new().unwrap()),
            fatal,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move { server.serve(listener, rx).await });
        (addr, tx)
    }

    async fn get(addr: SocketAddr, headers: &[(&'static str, &'static str)]) -> (StatusCode, http::HeaderMap, String) {
        let client: Client<_, Full<Bytes>> =
            Client::builder(TokioExecutor::new()).build_http();
        let mut builder = Request::builder().uri(format!("http://{}/youngster", addr));
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        let response = client
            .request(builder.body(Full::new(Bytes::new())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_response_substitution_end_to_end() {
        let backend = spawn_backend("take your book").await;
        let filter = HttpFilter {
            response: Action {
                replace: vec![Replacement::new("book", "smartphone", vec![])],
                headers: vec![],
            },
            ..HttpFilter::default()
        };
        let (proxy, _shutdown) = spawn_proxy(vec![http_rule(backend, 0, Restrictions::default(), filter)]).await;

        let (status, headers, body) = get(proxy, &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "take your smartphone");
        assert_eq!(headers.get("content-length").unwrap(), "20");
    }

    #[tokio::test]
    async fn test_token_rule_falls_through() {
        let dev = spawn_backend("dev backend").await;
        let fallback = spawn_backend("fallback backend").await;
        let token = Restrictions::default().with_token(
            HeaderName::from_static("x-env"),
            TokenCondition::new("dev", TokenAction::Accept),
        );
        let (proxy, _shutdown) = spawn_proxy(vec![
            http_rule(fallback, 1, Restrictions::default(), HttpFilter::default()),
            http_rule(dev, 10, token, HttpFilter::default()),
        ])
        .await;

        let (_, _, body) = get(proxy, &[]).await;
        assert_eq!(body, "fallback backend");

        let (_, _, body) = get(proxy, &[("x-env", "dev")]).await;
        assert_eq!(body, "dev backend");
    }

    #[tokio::test]
    async fn test_no_rule_is_not_found() {
        let backend = spawn_backend("hidden").await;
        let token = Restrictions::default().with_token(
            HeaderName::from_static("x-env"),
            TokenCondition::new("dev", TokenAction::Accept),
        );
        let (proxy, _shutdown) = spawn_proxy(vec![http_rule(backend, 0, token, HttpFilter::default())]).await;

        let (status, _, body) = get(proxy, &[("x-env", "prod")]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, NO_FILTER_BODY);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let backend = spawn_backend("bye").await;
        let mut dispatchers = build_dispatchers(vec![http_rule(
            backend,
            0,
            Restrictions::default(),
            HttpFilter::default(),
        )])
        .unwrap();
        let (fatal, _) = mpsc::unbounded_channel();
        let server = HttpServer::new(
            "127.0.0.1",
            dispatchers.remove(0),
            FilterHandler::new(BackendClients::new().unwrap()),
            fatal,
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { server.serve(listener, rx).await });

        tx.send(true).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
