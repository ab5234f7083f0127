//! Header injection

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;
use uuid::Uuid;

/// What a header rule does to the existing values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderOp {
    /// Append to the existing values, never overwrite
    Add,
    /// Set only when the header is absent or empty
    SetIfAbsent,
    /// Always replace the existing values
    Force,
}

/// Where the injected value comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValueSource {
    Static(HeaderValue),
    /// A fresh UUID for every application
    Unique,
}

impl HeaderValueSource {
    fn resolve(&self) -> HeaderValue {
        match self {
            HeaderValueSource::Static(value) => value.clone(),
            HeaderValueSource::Unique => HeaderValue::from_str(&Uuid::new_v4().to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("")),
        }
    }
}

/// A compiled header rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRule {
    pub name: HeaderName,
    pub value: HeaderValueSource,
    pub op: HeaderOp,
}

impl HeaderRule {
    pub fn new(name: HeaderName, value: HeaderValueSource, op: HeaderOp) -> Self {
        Self { name, value, op }
    }

    /// Derive the operation from the configuration flags; `add` wins over `force`.
    pub fn op_from_flags(add: bool, force: bool) -> HeaderOp {
        match (add, force) {
            (true, _) => HeaderOp::Add,
            (false, true) => HeaderOp::Force,
            (false, false) => HeaderOp::SetIfAbsent,
        }
    }
}

fn is_empty(headers: &HeaderMap, name: &HeaderName) -> bool {
    headers
        .get(name)
        .map(|value| value.as_bytes().is_empty())
        .unwrap_or(true)
}

/// Apply header rules in table order
pub fn apply_headers(headers: &mut HeaderMap, table: &[HeaderRule]) {
    for rule in table {
        match rule.op {
            HeaderOp::Add => {
                let value = rule.value.resolve();
                debug!(header = %rule.name, value = ?value, "Adding to header");
                if is_empty(headers, &rule.name) {
                    headers.insert(rule.name.clone(), value);
                } else {
                    headers.append(rule.name.clone(), value);
                }
            }
            HeaderOp::SetIfAbsent | HeaderOp::Force => {
                if rule.op == HeaderOp::Force || is_empty(headers, &rule.name) {
                    let value = rule.value.resolve();
                    debug!(header = %rule.name, value = ?value, "Set header");
                    headers.insert(rule.name.clone(), value);
                }
            }
        }
    }
}
