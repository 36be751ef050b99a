//! YAML configuration files: the custom pipeline config and its defaults.

use crate::error::{Error, Result};
use crate::utils::io;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigFile {
    pub general: Map<String, Value>,
    pub stages: BTreeMap<String, Map<String, Value>>,
    pub steps: BTreeMap<String, Map<String, Value>>,
    pub hooks: HooksConfig,
    /// Extra defaults files, applied below the built-in ones.
    pub custom_defaults: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HooksConfig {
    pub collector: Option<CollectorConfig>,
    pub splunk: Option<SplunkConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorConfig {
    pub directory: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplunkConfig {
    pub url: String,
    pub token: String,
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default)]
    pub send_logs: bool,
}

/// Expand `~` and `$VAR` in a configured path. Unknown variables are left as written.
pub fn expand_path(raw: &str) -> PathBuf {
    let expanded = shellexpand::full(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| shellexpand::tilde(raw).into_owned());
    PathBuf::from(expanded)
}

/// `config.yml` and `config.yaml` stand in for each other. The configured
/// name wins whenever it exists.
pub fn project_config_file(path: &Path) -> PathBuf {
    let alternate = match path.extension().and_then(|e| e.to_str()) {
        Some("yml") => path.with_extension("yaml"),
        Some("yaml") => path.with_extension("yml"),
        _ => return path.to_path_buf(),
    };
    if !path.exists() && alternate.exists() {
        alternate
    } else {
        path.to_path_buf()
    }
}

impl ConfigFile {
    pub fn parse(content: &str, origin: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yml::from_str(content).map_err(|e| Error::config_invalid_file(origin, e.to_string()))
    }

    /// Load a config file. A missing file is `None` when `optional`, an error otherwise.
    pub fn load(path: &Path, optional: bool) -> Result<Option<Self>> {
        let origin = path.display().to_string();
        if !path.exists() {
            if optional {
                return Ok(None);
            }
            return Err(Error::config_invalid_file(origin, "file does not exist"));
        }
        let content = io::read_file(path, "read config file")
            .map_err(|e| Error::config_invalid_file(origin.clone(), e.message))?;
        Self::parse(&content, &origin).map(Some)
    }

    pub fn stage(&self, name: &str) -> Option<&Map<String, Value>> {
        self.stages.get(name)
    }

    pub fn step(&self, name: &str) -> Option<&Map<String, Value>> {
        self.steps.get(name)
    }
}

/// Parse a host-supplied parameter document (JSON or YAML object).
pub fn parse_parameters(content: &str, origin: &str) -> Result<Map<String, Value>> {
    if content.trim().is_empty() {
        return Ok(Map::new());
    }
    let value: Value =
        serde_yml::from_str(content).map_err(|e| Error::config_invalid_file(origin, e.to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(Error::config_invalid_file(origin, "expected a mapping of parameters")),
    }
}
