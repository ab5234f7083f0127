//! Backend forwarding for HTTP rules
//!
//! Buffers the client request, runs it through the request phase, forwards
//! it to the rule's backend and runs the answer through the response phase.

use std::net::IpAddr;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::{HeaderMap, Request, Response, StatusCode};
use tracing::{debug, instrument, warn};

use super::exchange::ExchangeContext;
use super::request::rewrite_request;
use super::response::rewrite_response;
use super::transport::BackendClients;
use crate::error::{Result, VillipError};
use crate::rule::Rule;

/// Body sent when the backend cannot be reached
pub const BAD_GATEWAY_BODY: &str = "Bad Gateway";

/// Forwards exchanges selected by a dispatcher
#[derive(Clone)]
pub struct FilterHandler {
    clients: BackendClients,
}

impl FilterHandler {
    pub fn new(clients: BackendClients) -> Self {
        Self { clients }
    }

    /// Run one exchange against `rule`
    #[instrument(skip(self, rule, req), fields(method = %req.method(), path = %req.uri().path(), backend = %rule.backend()))]
    pub async fn handle<B>(
        &self,
        rule: &Rule,
        req: Request<B>,
        source: IpAddr,
    ) -> Result<Response<Full<Bytes>>>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let Some(filter) = rule.http_filter() else {
            return Err(VillipError::Internal(format!(
                "{} is not an HTTP rule",
                rule.source()
            )));
        };

        let (mut parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| VillipError::BodyRead(e.to_string()))?
            .to_bytes();

        let path = parts.uri.path().to_string();
        let url = filter.prefix_replace(&path);
        let mut ctx = ExchangeContext::new(source, path, url);

        let body = rewrite_request(rule, filter, &mut ctx, &mut parts, body)?;
        let outbound = Request::from_parts(parts, Full::new(body));

        let response = match self.clients.get(filter.insecure).request(outbound).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = ctx.url(), error = %e, "backend unreachable");
                return Ok(error_response(StatusCode::BAD_GATEWAY, BAD_GATEWAY_BODY));
            }
        };

        let (mut parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| VillipError::Backend(format!("failed to read response: {}", e)))?
            .to_bytes();
        debug!(status = parts.status.as_u16(), url = ctx.url(), "backend answered");

        let body = rewrite_response(rule, filter, &mut ctx, &mut parts, body)?;
        Ok(Response::from_parts(parts, Full::new(body)))
    }
}

/// Plaintext response for errors and policy outcomes
pub fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Drop hop-by-hop headers, including those named by `Connection`
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();

    for name in listed {
        headers.remove(name.as_str());
    }

    let hop: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in hop {
        headers.remove(name);
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
