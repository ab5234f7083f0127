//! Per-port rule selection
//!
//! Rules sharing a port are ordered once at startup: tiers by descending
//! priority, and within a tier conditional rules (most recently added first)
//! ahead of unconditional ones (in insertion order). Lookups walk that order
//! and never take a lock.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use http::HeaderMap;
use tracing::debug;

use crate::error::{Result, VillipError};
use crate::rule::{Kind, Rule};

/// Ordered, read-only rule list of one port
#[derive(Debug, Clone)]
pub struct Dispatcher {
    port: u16,
    kind: Kind,
    rules: Vec<Arc<Rule>>,
}

impl Dispatcher {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Rules in evaluation order
    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    /// Pick the first rule governing a request from `ip` with `headers`
    pub fn select(&self, ip: IpAddr, headers: &HeaderMap) -> Option<Arc<Rule>> {
        let selected = self.rules.iter().find(|r| r.is_concerned(ip, headers)).cloned();
        if selected.is_none() {
            debug!(port = self.port, source = %ip, "no rule for this request");
        }
        selected
    }
}

#[derive(Debug, Default)]
struct Tier {
    /// Stored in insertion order, evaluated newest first
    conditional: Vec<Rule>,
    unconditional: Vec<Rule>,
}

#[derive(Debug)]
struct PortRules {
    kind: Kind,
    tiers: BTreeMap<u8, Tier>,
}

impl PortRules {
    fn len(&self) -> usize {
        self.tiers
            .values()
            .map(|t| t.conditional.len() + t.unconditional.len())
            .sum()
    }
}

/// Groups rules by port and priority
#[derive(Debug, Default)]
pub struct DispatcherBuilder {
    ports: BTreeMap<u16, PortRules>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a rule in its port list.
    ///
    /// A raw TCP port takes exactly one rule and a port never mixes kinds.
    pub fn insert(&mut self, rule: Rule) -> Result<()> {
        let port = rule.port();
        let entry = self.ports.entry(port).or_insert_with(|| PortRules {
            kind: rule.kind(),
            tiers: BTreeMap::new(),
        });

        if entry.kind != rule.kind() {
            return Err(VillipError::PortConflict {
                port,
                reason: format!(
                    "cannot mix {} and {} rules on the same port",
                    entry.kind.as_str(),
                    rule.kind().as_str()
                ),
            });
        }
        if entry.kind == Kind::Tcp && entry.len() > 0 {
            return Err(VillipError::PortConflict {
                port,
                reason: "cannot have several rules on the same port for raw proxy".into(),
            });
        }

        let tier = entry.tiers.entry(rule.priority()).or_default();
        if rule.is_conditional() {
            tier.conditional.push(rule);
        } else {
            tier.unconditional.push(rule);
        }
        Ok(())
    }

    pub fn with(mut self, rule: Rule) -> Result<Self> {
        self.insert(rule)?;
        Ok(self)
    }

    /// Freeze the lists, one dispatcher per port in port order
    pub fn build(self) -> Vec<Dispatcher> {
        self.ports
            .into_iter()
            .map(|(port, port_rules)| {
                let rules = port_rules
                    .tiers
                    .into_iter()
                    .rev()
                    .flat_map(|(_, tier)| {
                        tier.conditional
                            .into_iter()
                            .rev()
                            .chain(tier.unconditional)
                    })
                    .map(Arc::new)
                    .collect();

                Dispatcher {
                    port,
                    kind: port_rules.kind,
                    rules,
                }
            })
            .collect()
    }
}

/// Build every dispatcher from a rule set
pub fn build_dispatchers(rules: impl IntoIterator<Item = Rule>) -> Result<Vec<Dispatcher>> {
    let mut builder = DispatcherBuilder::new();
    for rule in rules {
        builder.insert(rule)?;
    }
    Ok(builder.build())
}
