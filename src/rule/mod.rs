//! Routing and rewrite rules
//!
//! A [`Rule`] binds one backend origin to a listening port, with the
//! predicates deciding which inbound traffic it governs and, for HTTP rules,
//! the rewrite tables applied to that traffic. Rules are immutable once built
//! and shared between concurrent exchanges.

pub mod builder;
pub mod config;
pub mod loader;
pub mod restrictions;

use std::net::IpAddr;

use http::HeaderMap;
use url::Url;

use crate::dump::DumpSettings;
use crate::rewrite::{substitute, HeaderRule, ReplaceMode, Replacement};

pub use config::RuleConfig;
pub use restrictions::{Restrictions, TokenAction, TokenCondition};

/// Status codes filtered when none are configured
pub const DEFAULT_STATUSES: [u16; 3] = [200, 302, 301];

/// Content types filtered when none are configured
pub const DEFAULT_CONTENT_TYPES: [&str; 3] = ["text/html", "text/css", "application/javascript"];

/// Server kind a rule is served by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Http,
    Tcp,
}

impl Kind {
    /// Case-insensitive; anything but `tcp` is served over HTTP
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "tcp" => Self::Tcp,
            _ => Self::Http,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
        }
    }
}

/// Replacement and header tables of one side of the exchange
#[derive(Debug, Clone, Default)]
pub struct Action {
    pub replace: Vec<Replacement>,
    pub headers: Vec<HeaderRule>,
}

impl Action {
    pub fn is_empty(&self) -> bool {
        self.replace.is_empty() && self.headers.is_empty()
    }
}

/// HTTP-only part of a rule
#[derive(Debug, Clone)]
pub struct HttpFilter {
    /// Skip certificate verification towards the backend
    pub insecure: bool,
    /// Rewrite responses regardless of status and content type
    pub force: bool,
    pub statuses: Vec<u16>,
    pub content_types: Vec<String>,
    pub prefix: Vec<Replacement>,
    pub request: Action,
    pub response: Action,
    pub dump: DumpSettings,
}

impl Default for HttpFilter {
    fn default() -> Self {
        Self {
            insecure: false,
            force: false,
            statuses: DEFAULT_STATUSES.to_vec(),
            content_types: DEFAULT_CONTENT_TYPES.iter().map(|s| s.to_string()).collect(),
            prefix: Vec::new(),
            request: Action::default(),
            response: Action::default(),
            dump: DumpSettings::default(),
        }
    }
}

impl HttpFilter {
    /// Decide whether a response is eligible for rewriting.
    ///
    /// The status must be accepted; a 200 additionally needs a filtered
    /// content type.
    pub fn accepts_response(&self, status: u16, content_type: &str) -> bool {
        if !self.statuses.contains(&status) {
            return false;
        }
        if status == 200 {
            return self.content_types.iter().any(|t| content_type.contains(t.as_str()));
        }
        true
    }

    pub fn rewrites_request(&self) -> bool {
        !self.request.is_empty() || self.dump.is_enabled()
    }

    pub fn rewrites_response(&self) -> bool {
        !self.response.is_empty() || self.dump.is_enabled()
    }

    /// Translate an external path into the internal path space
    pub fn prefix_replace(&self, url: &str) -> String {
        substitute(url, url, &self.prefix, ReplaceMode::Prefix)
    }
}

/// Protocol-specific part of a rule
#[derive(Debug, Clone)]
pub enum RuleKind {
    Http(Box<HttpFilter>),
    Tcp,
}

/// A compiled rule
#[derive(Debug, Clone)]
pub struct Rule {
    source: String,
    backend: Url,
    port: u16,
    priority: u8,
    restrictions: Restrictions,
    kind: RuleKind,
}

impl Rule {
    pub fn new(
        source: impl Into<String>,
        backend: Url,
        port: u16,
        priority: u8,
        restrictions: Restrictions,
        kind: RuleKind,
    ) -> Self {
        Self {
            source: source.into(),
            backend,
            port,
            priority,
            restrictions,
            kind,
        }
    }

    /// Convenience constructor for an HTTP rule
    pub fn http(
        backend: Url,
        port: u16,
        priority: u8,
        restrictions: Restrictions,
        filter: HttpFilter,
    ) -> Self {
        Self::new(
            "inline",
            backend,
            port,
            priority,
            restrictions,
            RuleKind::Http(Box::new(filter)),
        )
    }

    /// Convenience constructor for a raw TCP rule
    pub fn tcp(backend: Url, port: u16) -> Self {
        Self::new("inline", backend, port, 0, Restrictions::default(), RuleKind::Tcp)
    }

    /// Where the rule came from (file name or `env`)
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn backend(&self) -> &Url {
        &self.backend
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn restrictions(&self) -> &Restrictions {
        &self.restrictions
    }

    pub fn kind(&self) -> Kind {
        match self.kind {
            RuleKind::Http(_) => Kind::Http,
            RuleKind::Tcp => Kind::Tcp,
        }
    }

    /// HTTP rewrite tables, `None` for TCP rules
    pub fn http_filter(&self) -> Option<&HttpFilter> {
        match &self.kind {
            RuleKind::Http(filter) => Some(filter),
            RuleKind::Tcp => None,
        }
    }

    pub fn is_conditional(&self) -> bool {
        self.restrictions.is_conditional()
    }

    pub fn is_authorized(&self, ip: IpAddr) -> bool {
        self.restrictions.is_authorized(ip)
    }

    pub fn is_accepted(&self, headers: &HeaderMap) -> bool {
        self.restrictions.is_accepted(headers)
    }

    /// Check whether this rule governs a request
    pub fn is_concerned(&self, ip: IpAddr, headers: &HeaderMap) -> bool {
        self.is_authorized(ip) && self.is_accepted(headers)
    }

    /// Translate an external path; TCP rules leave it untouched
    pub fn prefix_replace(&self, url: &str) -> String {
        match self.http_filter() {
            Some(filter) => filter.prefix_replace(url),
            None => url.to_string(),
        }
    }

    /// `host:port` of a TCP backend, without the `tcp://` scheme
    pub fn tcp_address(&self) -> String {
        let raw = self.backend.as_str();
        raw.strip_prefix("tcp://")
            .unwrap_or(raw)
            .trim_end_matches('/')
            .to_string()
    }
}
