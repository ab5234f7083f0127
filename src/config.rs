use crate::error::{Result, VillipError};
use std::env;
use std::path::PathBuf;

/// Process configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Host every rule listener binds to (default: 0.0.0.0)
    pub host: String,
    /// Where rules come from
    pub rules: RuleSourceConfig,
    /// Liveness endpoint
    pub health: HealthConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSourceConfig {
    /// Build one rule from the VILLIP_* variables
    pub from_env: bool,
    /// Folder of YAML/JSON rule files
    pub folder: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    /// Port of the liveness server, disabled when unset
    pub port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl LogConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }

    /// Default directive for the tracing filter when RUST_LOG is not set
    pub fn directive(&self) -> String {
        format!("villip={},tower_http={}", self.level, self.level)
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let folder = env::var("VILLIP_FOLDER")
            .ok()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .map(PathBuf::from);

        let health_port = match env::var("VILLIP_HEALTHPORT") {
            Ok(raw) if !raw.trim().is_empty() => Some(raw.trim().parse().map_err(|_| {
                VillipError::InvalidConfig("VILLIP_HEALTHPORT must be a valid port number".into())
            })?),
            _ => None,
        };

        Ok(Config {
            host: get_env_or("VILLIP_HOST", "0.0.0.0"),
            rules: RuleSourceConfig {
                from_env: env::var("VILLIP_URL").is_ok(),
                folder,
            },
            health: HealthConfig { port: health_port },
            log: LogConfig {
                level: if env::var("VILLIP_DEBUG").is_ok() {
                    "debug".to_string()
                } else {
                    "info".to_string()
                },
                format: get_env_or("VILLIP_LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Check that at least one rule source is configured
    pub fn has_rule_source(&self) -> bool {
        self.rules.from_env || self.rules.folder.is_some()
    }

    /// Get the liveness server address
    pub fn health_addr(&self) -> Option<String> {
        self.health.port.map(|port| format!("{}:{}", self.host, port))
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
