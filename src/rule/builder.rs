//! Rule compilation
//!
//! Turns a [`RuleConfig`] into an immutable [`Rule`]. Every validation happens
//! here so that a running listener never meets a malformed rule.

use std::net::IpAddr;
use std::path::PathBuf;

use http::header::{HeaderName, HeaderValue};
use ipnet::IpNet;
use regex::Regex;
use tracing::{debug, info};
use url::Url;

use super::config::{HeaderConfig, ReplacementConfig, RuleConfig, TokenConfig};
use super::{Action, HttpFilter, Kind, Restrictions, Rule, RuleKind, TokenAction, TokenCondition};
use super::{DEFAULT_CONTENT_TYPES, DEFAULT_STATUSES};
use crate::dump::DumpSettings;
use crate::error::{Result, VillipError};
use crate::rewrite::{
    substitute, HeaderOp, HeaderRule, HeaderValueSource, ReplaceMode, Replacement,
};

const DEFAULT_PORT: u16 = 8080;

impl Rule {
    /// Compile a rule record. `source` names where the record came from.
    pub fn from_config(source: &str, c: RuleConfig) -> Result<Self> {
        if c.url.trim().is_empty() {
            return Err(VillipError::InvalidConfig("Missing url variable".into()));
        }

        let port = parse_port(c.port)?;
        let kind = Kind::parse(&c.kind);
        let backend = parse_backend(&c.url, kind)?;
        let restrictions = parse_restrictions(&c.restricted, &c.token)?;

        let rule_kind = match kind {
            Kind::Tcp => RuleKind::Tcp,
            Kind::Http => RuleKind::Http(Box::new(build_http_filter(&c)?)),
        };

        let rule = Rule::new(source, backend, port, c.priority, restrictions, rule_kind);
        rule.log_summary();
        Ok(rule)
    }

    /// Log what the rule does once it is built
    pub fn log_summary(&self) {
        let networks: Vec<String> = self.restrictions().networks().iter().map(|n| n.to_string()).collect();
        info!(
            port = self.port(),
            url = %self.backend(),
            priority = self.priority(),
            kind = self.kind().as_str(),
            source = self.source(),
            restricted = ?networks,
            "Rule loaded"
        );

        for (header, conditions) in self.restrictions().tokens() {
            for cond in conditions {
                info!(port = self.port(), header = %header, value = %cond.value, action = ?cond.action, "Token condition");
            }
        }

        let Some(filter) = self.http_filter() else {
            return;
        };

        info!(port = self.port(), content_types = ?filter.content_types, statuses = ?filter.statuses, force = filter.force, "Filtering");
        for (side, action) in [("request", &filter.request), ("response", &filter.response)] {
            for rep in &action.replace {
                let scopes: Vec<&str> = rep.urls.iter().map(|r| r.as_str()).collect();
                info!(port = self.port(), side, from = %rep.from, to = %rep.to, urls = ?scopes, "Replacement");
            }
            for h in &action.headers {
                let forced = h.op == HeaderOp::Force;
                info!(port = self.port(), side, header = %h.name, op = ?h.op, force = forced, "Header rule");
            }
        }
        for rep in &filter.prefix {
            info!(port = self.port(), from = %rep.from, to = %rep.to, "Prefix replacement");
        }
        if filter.dump.is_enabled() {
            info!(port = self.port(), folder = ?filter.dump.folder(), "Dump enabled");
        }
    }
}

fn parse_port(port: i64) -> Result<u16> {
    if port == 0 {
        return Ok(DEFAULT_PORT);
    }
    u16::try_from(port).map_err(|_| VillipError::InvalidPort(port.to_string()))
}

fn parse_backend(raw: &str, kind: Kind) -> Result<Url> {
    let url = Url::parse(raw.trim())?;
    let valid = match kind {
        Kind::Tcp => url.scheme() == "tcp",
        Kind::Http => matches!(url.scheme(), "http" | "https"),
    };
    if !valid {
        return Err(VillipError::InvalidConfig(format!(
            "{} is not a valid {} backend url",
            raw,
            kind.as_str()
        )));
    }
    Ok(url)
}

/// Parse a CIDR; a bare address becomes a host route
fn parse_network(raw: &str) -> Result<IpNet> {
    let raw = raw.trim();
    if let Ok(net) = raw.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    raw.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| VillipError::InvalidCidr(raw.to_string()))
}

fn parse_token(token: &TokenConfig) -> Result<(HeaderName, TokenCondition)> {
    if token.header.is_empty() {
        return Err(VillipError::InvalidConfig(
            "token header parameter cannot be empty".into(),
        ));
    }
    let header = HeaderName::from_bytes(token.header.as_bytes())
        .map_err(|e| VillipError::InvalidConfig(format!("invalid token header {}: {}", token.header, e)))?;
    let action = TokenAction::parse(&token.action)
        .ok_or_else(|| VillipError::InvalidTokenAction(token.action.clone()))?;

    Ok((header, TokenCondition::new(token.value.clone(), action)))
}

fn parse_restrictions(restricted: &[String], tokens: &[TokenConfig]) -> Result<Restrictions> {
    let networks = restricted
        .iter()
        .filter(|s| !s.trim().is_empty())
        .map(|s| parse_network(s))
        .collect::<Result<Vec<_>>>()?;

    let mut restrictions = Restrictions::new(networks);
    for token in tokens {
        let (header, condition) = parse_token(token)?;
        restrictions.add_token(header, condition);
    }
    Ok(restrictions)
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| VillipError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

fn anchor(pattern: &str) -> String {
    if pattern.starts_with('^') {
        pattern.to_string()
    } else {
        format!("^{}", pattern)
    }
}

/// Compile the prefix table; its own scopes are anchored but not rewritten
fn parse_prefix(entries: &[ReplacementConfig]) -> Result<Vec<Replacement>> {
    entries
        .iter()
        .map(|e| {
            let urls = e
                .urls
                .iter()
                .map(|u| compile(&anchor(u)))
                .collect::<Result<Vec<_>>>()?;
            Ok(Replacement::new(e.from.clone(), e.to.clone(), urls))
        })
        .collect()
}

/// Compile a substitution table. Scopes are written against external paths
/// and translated into the internal path space through the prefix table.
fn parse_replacements(entries: &[ReplacementConfig], prefix: &[Replacement]) -> Result<Vec<Replacement>> {
    entries
        .iter()
        .map(|e| {
            let urls = e
                .urls
                .iter()
                .map(|u| {
                    let rewritten = substitute(u, u, prefix, ReplaceMode::Prefix);
                    compile(&anchor(&rewritten))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Replacement::new(e.from.clone(), e.to.clone(), urls))
        })
        .collect()
}

fn parse_headers(entries: &[HeaderConfig]) -> Result<Vec<HeaderRule>> {
    entries
        .iter()
        .map(|h| {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .map_err(|e| VillipError::InvalidConfig(format!("invalid header name {}: {}", h.name, e)))?;
            let value = if h.uuid {
                HeaderValueSource::Unique
            } else {
                HeaderValueSource::Static(HeaderValue::from_str(&h.value).map_err(|e| {
                    VillipError::InvalidConfig(format!("invalid value for header {}: {}", h.name, e))
                })?)
            };
            Ok(HeaderRule::new(name, value, HeaderRule::op_from_flags(h.add, h.force)))
        })
        .collect()
}

fn parse_statuses(extra: &[String]) -> Result<Vec<u16>> {
    let mut statuses = DEFAULT_STATUSES.to_vec();
    for raw in extra {
        let status = raw
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|s| (100..=999).contains(s))
            .ok_or_else(|| VillipError::InvalidStatus(raw.clone()))?;
        statuses.push(status);
    }
    Ok(statuses)
}

fn parse_dump(folder: &str, urls: &[String]) -> Result<DumpSettings> {
    let folder = if folder.is_empty() {
        None
    } else {
        let path = PathBuf::from(folder);
        std::fs::create_dir_all(&path).map_err(|e| {
            VillipError::InvalidConfig(format!("Failed to create the dump folder {}: {}", folder, e))
        })?;
        debug!(folder, "dump folder ready");
        Some(path)
    };

    let urls = urls.iter().map(|u| compile(u)).collect::<Result<Vec<_>>>()?;
    Ok(DumpSettings::new(folder, urls))
}

fn build_http_filter(c: &RuleConfig) -> Result<HttpFilter> {
    let response_replace = match (c.replace.is_empty(), c.response.replace.is_empty()) {
        (false, false) => return Err(VillipError::ConflictingReplace),
        (false, true) => &c.replace,
        _ => &c.response.replace,
    };

    let prefix = parse_prefix(&c.prefix)?;

    let content_types = if c.content_types.is_empty() {
        DEFAULT_CONTENT_TYPES.iter().map(|s| s.to_string()).collect()
    } else {
        c.content_types.clone()
    };

    Ok(HttpFilter {
        insecure: c.insecure,
        force: c.force,
        statuses: parse_statuses(&c.status)?,
        content_types,
        request: Action {
            replace: parse_replacements(&c.request.replace, &prefix)?,
            headers: parse_headers(&c.request.header)?,
        },
        response: Action {
            replace: parse_replacements(response_replace, &prefix)?,
            headers: parse_headers(&c.response.header)?,
        },
        dump: parse_dump(&c.dump.folder, &c.dump.urls)?,
        prefix,
    })
}
