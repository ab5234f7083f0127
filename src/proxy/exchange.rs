//! Exchange-scoped state
//!
//! Created when a rule accepts a request and dropped once the response has
//! been written, it carries what the response phase needs to know about the
//! request phase.

use std::net::IpAddr;

use http::HeaderMap;

use crate::dump::{generate_request_id, REQUEST_ID_HEADER};

/// State of one HTTP exchange
#[derive(Debug, Clone)]
pub struct ExchangeContext {
    source: IpAddr,
    /// Path as requested by the client
    path: String,
    /// Prefix-rewritten path, the key for scope matching
    url: String,
    request_id: Option<String>,
}

impl ExchangeContext {
    pub fn new(source: IpAddr, path: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source,
            path: path.into(),
            url: url.into(),
            request_id: None,
        }
    }

    pub fn source(&self) -> IpAddr {
        self.source
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Mint a new correlation id for this exchange
    pub fn start_correlation(&mut self) -> &str {
        self.request_id.insert(generate_request_id())
    }

    /// Correlation id of the exchange, falling back to one carried by headers,
    /// then to a fresh one
    pub fn correlation_for(&mut self, headers: &HeaderMap) -> String {
        if let Some(id) = &self.request_id {
            return id.clone();
        }

        let id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_request_id);
        self.request_id = Some(id.clone());
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn ctx() -> ExchangeContext {
        ExchangeContext::new("127.0.0.1".parse().unwrap(), "/env/a", "/dev/env/a")
    }

    #[test]
    fn test_start_correlation() {
        let mut c = ctx();
        assert!(c.request_id().is_none());
        let id = c.start_correlation().to_string();
        assert_eq!(c.request_id(), Some(id.as_str()));
        assert_eq!(c.correlation_for(&HeaderMap::new()), id);
    }

    #[test]
    fn test_correlation_from_headers() {
        let mut c = ctx();
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("abcdef"));
        assert_eq!(c.correlation_for(&headers), "abcdef");
        assert_eq!(c.request_id(), Some("abcdef"));
    }

    #[test]
    fn test_correlation_generated() {
        let mut c = ctx();
        let id = c.correlation_for(&HeaderMap::new());
        assert_eq!(id.len(), 24);
        assert_eq!(c.correlation_for(&HeaderMap::new()), id);
    }

    #[test]
    fn test_paths() {
        let c = ctx();
        assert_eq!(c.path(), "/env/a");
        assert_eq!(c.url(), "/dev/env/a");
    }
}
