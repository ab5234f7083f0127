//! Restriction predicates
//!
//! A rule may be limited to source networks and to requests carrying header
//! tokens. Both predicates take part in routing; the network one is checked a
//! second time when the backend response comes back.

use std::net::IpAddr;

use http::header::{HeaderMap, HeaderName};
use ipnet::IpNet;
use tracing::debug;

/// Action attached to a header token condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAction {
    Accept,
    Reject,
    NotEmpty,
}

impl TokenAction {
    /// Parse an action name, case-insensitively
    pub fn parse(action: &str) -> Option<Self> {
        match action.to_lowercase().as_str() {
            "accept" => Some(Self::Accept),
            "reject" => Some(Self::Reject),
            "notempty" | "not-empty" | "not_empty" => Some(Self::NotEmpty),
            _ => None,
        }
    }
}

/// One value check for a header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenCondition {
    pub value: String,
    pub action: TokenAction,
}

impl TokenCondition {
    pub fn new(value: impl Into<String>, action: TokenAction) -> Self {
        Self {
            value: value.into(),
            action,
        }
    }
}

/// Source network and header token restrictions of a rule
#[derive(Debug, Clone, Default)]
pub struct Restrictions {
    networks: Vec<IpNet>,
    tokens: Vec<(HeaderName, Vec<TokenCondition>)>,
}

impl Restrictions {
    pub fn new(networks: Vec<IpNet>) -> Self {
        Self {
            networks,
            tokens: Vec::new(),
        }
    }

    /// Add a token condition, grouping conditions by header name
    pub fn add_token(&mut self, header: HeaderName, condition: TokenCondition) {
        match self.tokens.iter_mut().find(|(name, _)| *name == header) {
            Some((_, conditions)) => conditions.push(condition),
            None => self.tokens.push((header, vec![condition])),
        }
    }

    pub fn with_token(mut self, header: HeaderName, condition: TokenCondition) -> Self {
        self.add_token(header, condition);
        self
    }

    pub fn networks(&self) -> &[IpNet] {
        &self.networks
    }

    pub fn tokens(&self) -> &[(HeaderName, Vec<TokenCondition>)] {
        &self.tokens
    }

    /// A rule with any restriction is conditional
    pub fn is_conditional(&self) -> bool {
        !self.networks.is_empty() || !self.tokens.is_empty()
    }

    /// Check the source address against the network list.
    ///
    /// Loopback is always authorized and an empty list authorizes everybody.
    pub fn is_authorized(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        if ip.is_loopback() || self.networks.is_empty() {
            return true;
        }

        if self.networks.iter().any(|net| net.contains(&ip)) {
            return true;
        }

        debug!(source = %ip, "filter forbidden for this IP");
        false
    }

    /// Check the request headers against every token condition
    pub fn is_accepted(&self, headers: &HeaderMap) -> bool {
        for (name, conditions) in &self.tokens {
            let values: Vec<&[u8]> = headers.get_all(name).iter().map(|v| v.as_bytes()).collect();
            if values.is_empty() {
                debug!(header = %name, "missing header for this filter");
                return false;
            }

            let mut accepted =
                conditions.len() == 1 && conditions[0].action == TokenAction::NotEmpty;
            let mut rejected = false;

            for value in &values {
                for cond in conditions {
                    match cond.action {
                        TokenAction::NotEmpty => accepted = true,
                        TokenAction::Accept => {
                            if *value == cond.value.as_bytes() {
                                accepted = true;
                            }
                        }
                        TokenAction::Reject => {
                            if *value == cond.value.as_bytes() {
                                rejected = true;
                            }
                        }
                    }
                }
            }

            if rejected || !accepted {
                debug!(header = %name, "Refused");
                return false;
            }
        }

        true
    }
}
