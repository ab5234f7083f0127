//! Declarative rule records
//!
//! A [`RuleConfig`] is the uncompiled form of a rule, read from a YAML file, a
//! JSON file or the `VILLIP_*` environment variables. Compilation happens in
//! [`super::builder`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VillipError};

/// One substitution entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplacementConfig {
    pub from: String,
    pub to: String,
    pub urls: Vec<String>,
}

/// Dump capture settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    pub folder: String,
    pub urls: Vec<String>,
}

/// One header injection entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderConfig {
    pub name: String,
    pub value: String,
    pub force: bool,
    pub add: bool,
    pub uuid: bool,
}

/// Replacement and header tables of one side of the exchange
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    pub replace: Vec<ReplacementConfig>,
    pub header: Vec<HeaderConfig>,
}

/// One header token condition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub header: String,
    pub value: String,
    pub action: String,
}

/// Uncompiled rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RuleConfig {
    pub content_types: Vec<String>,
    pub dump: DumpConfig,
    pub force: bool,
    pub insecure: bool,
    /// Listening port, 0 means 8080
    pub port: i64,
    pub prefix: Vec<ReplacementConfig>,
    pub priority: u8,
    /// Legacy alias of `response.replace`
    pub replace: Vec<ReplacementConfig>,
    pub request: ActionConfig,
    pub response: ActionConfig,
    pub restricted: Vec<String>,
    pub status: Vec<String>,
    pub token: Vec<TokenConfig>,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
}

impl RuleConfig {
    /// Parse a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Parse a JSON document
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Read a rule from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read a rule from `VILLIP_*` variables provided by `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut c = RuleConfig {
            url: lookup("VILLIP_URL").ok_or_else(|| {
                VillipError::InvalidConfig("Missing VILLIP_URL environment variable".into())
            })?,
            ..Default::default()
        };

        if let Some(raw) = lookup("VILLIP_PRIORITY") {
            c.priority = raw
                .trim()
                .parse::<u8>()
                .map_err(|_| VillipError::InvalidPriority(raw.clone()))?;
        }

        let port = lookup("VILLIP_PORT").unwrap_or_default();
        let port = if port.trim().is_empty() { "8080".to_string() } else { port };
        c.port = port
            .trim()
            .parse()
            .map_err(|_| VillipError::InvalidPort(port.clone()))?;

        c.kind = lookup("VILLIP_TYPE").unwrap_or_default();
        c.force = lookup("VILLIP_FORCE").is_some();
        c.insecure = lookup("VILLIP_INSECURE").is_some();

        if let Some(folder) = lookup("VILLIP_DUMPFOLDER") {
            c.dump.folder = folder;
        }
        if let Some(urls) = lookup("VILLIP_DUMPURLS") {
            c.dump.urls = split_list(&urls);
        }

        if let Some(from) = lookup("VILLIP_FROM") {
            let to = lookup("VILLIP_TO").ok_or_else(|| {
                VillipError::InvalidConfig("Missing VILLIP_TO environment variable".into())
            })?;
            let urls = lookup("VILLIP_FOR").map(|u| split_list(&u)).unwrap_or_default();
            c.response.replace.push(ReplacementConfig { from, to, urls });
        }

        let mut i = 1;
        while let Some(from) = lookup(&format!("VILLIP_FROM_{}", i)) {
            let to = lookup(&format!("VILLIP_TO_{}", i)).ok_or_else(|| {
                VillipError::InvalidConfig(format!("Missing VILLIP_TO_{} environment variable", i))
            })?;
            let urls = lookup(&format!("VILLIP_FOR_{}", i))
                .map(|u| split_list(&u))
                .unwrap_or_default();
            c.response.replace.push(ReplacementConfig { from, to, urls });
            i += 1;
        }

        if let Some(restricted) = lookup("VILLIP_RESTRICTED") {
            c.restricted = split_list(&restricted);
        }
        if let Some(status) = lookup("VILLIP_STATUS") {
            c.status = split_list(&status);
        }
        if let Some(types) = lookup("VILLIP_TYPES") {
            c.content_types = split_list(&types);
        }

        if let Some(from) = lookup("VILLIP_PREFIX_FROM") {
            let to = lookup("VILLIP_PREFIX_TO").ok_or_else(|| {
                VillipError::InvalidConfig("Missing VILLIP_PREFIX_TO environment variable".into())
            })?;
            c.prefix = vec![ReplacementConfig {
                from,
                to,
                urls: Vec::new(),
            }];
        }

        Ok(c)
    }
}

/// Split a comma separated list, dropping blanks
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
