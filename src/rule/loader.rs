//! Discovery of rule sources
//!
//! Rules come from the environment (when `VILLIP_URL` is set) and from every
//! YAML or JSON file of the configured folder, in that order.

use std::path::Path;

use tracing::{debug, info};

use super::{Rule, RuleConfig};
use crate::error::{Result, VillipError};

/// Format of a rule file, decided by its extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Yaml,
    Json,
}

impl FileFormat {
    fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => Some(Self::Yaml),
            Some("json") => Some(Self::Json),
            _ => None,
        }
    }
}

/// Compile a single rule file
pub fn load_file(path: &Path) -> Result<Rule> {
    let format = FileFormat::from_path(path).ok_or_else(|| {
        VillipError::InvalidConfig(format!("{} is not a YAML or JSON file", path.display()))
    })?;

    let config = match format {
        FileFormat::Yaml => RuleConfig::from_yaml_file(path)?,
        FileFormat::Json => RuleConfig::from_json_file(path)?,
    };

    let source = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    Rule::from_config(&source, config).map_err(|e| match e {
        VillipError::InvalidConfig(msg) => VillipError::InvalidConfig(format!("{}: {}", source, msg)),
        other => other,
    })
}

/// Compile every rule file of a folder, sorted by file name
pub fn load_folder(folder: &Path) -> Result<Vec<Rule>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        if FileFormat::from_path(&path).is_none() {
            debug!(file = %path.display(), "ignoring file");
            continue;
        }
        paths.push(path);
    }
    paths.sort();

    paths.iter().map(|p| load_file(p)).collect()
}

/// Load all configured rules
pub fn load_rules(from_env: bool, folder: Option<&Path>) -> Result<Vec<Rule>> {
    let mut rules = Vec::new();

    if from_env {
        rules.push(Rule::from_config("env", RuleConfig::from_env()?)?);
    }

    if let Some(folder) = folder {
        let loaded = load_folder(folder)?;
        info!(folder = %folder.display(), count = loaded.len(), "rule files loaded");
        rules.extend(loaded);
    }

    Ok(rules)
}
