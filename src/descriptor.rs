//! Model descriptor: the structured configuration document describing a
//! model's identity, worker entry point, dependencies and handlers.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SupervisorError};

/// Handler names the worker dispatcher reserves for its own protocol.
pub const RESERVED_HANDLER_NAMES: &[&str] = &["ping", "shutdown"];

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_python() -> String {
    ">=3.11".to_string()
}

fn default_requirements() -> String {
    "requirements.txt".to_string()
}

fn default_probe_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_max_failures() -> u32 {
    3
}

/// `client.module` / `client.class` — the worker's entry point, carried
/// verbatim since the worker program is an external interpreter this crate
/// does not compile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    pub module: String,
    #[serde(rename = "class")]
    pub class_name: String,
}

/// A single declared handler. `input`/`output` are opaque JSON schema
/// records, never interpreted by this crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandlerConfig {
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub output: serde_json::Map<String, serde_json::Value>,
}

/// Liveness-probing policy for the health monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthConfig {
    #[serde(default = "default_probe_interval")]
    pub interval: u64,
    #[serde(default = "default_probe_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            interval: default_probe_interval(),
            timeout: default_probe_timeout(),
            max_failures: default_max_failures(),
        }
    }
}

/// Optional resource hints passed through to the environment provisioner.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_ids: Option<Vec<u32>>,
}

/// A model descriptor as loaded from `model.yaml` / `model.yml` /
/// `model.toml`. Unknown top-level keys are preserved in `extra` so that
/// round-tripping a descriptor never drops data the caller didn't ask this
/// crate to understand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default = "default_python")]
    pub python: String,

    pub client: ClientConfig,

    #[serde(default = "default_requirements")]
    pub requirements: String,

    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub resources: ResourceConfig,

    /// Directory the descriptor was loaded from. Not serialised.
    #[serde(skip)]
    pub model_dir: Option<PathBuf>,

    /// Unrecognised top-level keys, preserved for forward compatibility.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ModelDescriptor {
    /// Validate name format and handler-name invariants.
    pub fn validate(&self) -> Result<()> {
        let valid_name = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_name {
            return Err(SupervisorError::ConfigInvalid {
                name: self.name.clone(),
                detail: "model name must be alphanumeric with '_' or '-'".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for handler in &self.handlers {
            if RESERVED_HANDLER_NAMES.contains(&handler.name.as_str()) {
                return Err(SupervisorError::ConfigInvalid {
                    name: self.name.clone(),
                    detail: format!("handler name '{}' is reserved", handler.name),
                });
            }
            if !seen.insert(handler.name.as_str()) {
                return Err(SupervisorError::ConfigInvalid {
                    name: self.name.clone(),
                    detail: format!("duplicate handler name '{}'", handler.name),
                });
            }
        }
        Ok(())
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name.as_str()).collect()
    }

    pub fn get_handler(&self, name: &str) -> Option<&HandlerConfig> {
        self.handlers.iter().find(|h| h.name == name)
    }

    pub fn requirements_path(&self) -> PathBuf {
        self.model_dir
            .as_deref()
            .unwrap_or_else(|| Path::new("."))
            .join(&self.requirements)
    }

    pub fn client_module_path(&self) -> String {
        self.client.module.clone()
    }
}

/// Recognised descriptor file names, checked in order.
pub const DESCRIPTOR_FILE_NAMES: &[&str] = &["model.yaml", "model.yml", "model.toml"];

/// Locate a descriptor file inside `model_dir`.
pub fn find_descriptor(model_dir: &Path) -> Option<PathBuf> {
    DESCRIPTOR_FILE_NAMES
        .iter()
        .map(|name| model_dir.join(name))
        .find(|path| path.is_file())
}

/// Parse a descriptor document from its textual content, inferring the
/// format from the file extension (`.yaml`/`.yml` vs `.toml`).
pub fn parse_descriptor(content: &str, file_name: &str) -> Result<ModelDescriptor> {
    let is_toml = file_name.ends_with(".toml");
    let descriptor: ModelDescriptor = if is_toml {
        toml::from_str(content).map_err(|e| SupervisorError::ConfigInvalid {
            name: file_name.to_string(),
            detail: format!("toml parse error: {e}"),
        })?
    } else {
        serde_yaml::from_str(content).map_err(|e| SupervisorError::ConfigInvalid {
            name: file_name.to_string(),
            detail: format!("yaml parse error: {e}"),
        })?
    };
    descriptor.validate()?;
    Ok(descriptor)
}

/// Load and validate a descriptor from a model directory.
pub fn load_descriptor_from_dir(model_dir: &Path) -> Result<ModelDescriptor> {
    let path = find_descriptor(model_dir).ok_or_else(|| SupervisorError::ConfigInvalid {
        name: model_dir.display().to_string(),
        detail: "no model.yaml, model.yml or model.toml found".to_string(),
    })?;
    let content = std::fs::read_to_string(&path)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let mut descriptor = parse_descriptor(&content, file_name)?;
    descriptor.model_dir = Some(model_dir.to_path_buf());
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        "name: demo\nclient:\n  module: demo.client\n  class: DemoClient\n"
    }

    #[test]
    fn parses_minimal_descriptor_with_defaults() {
        let d = parse_descriptor(minimal_yaml(), "model.yaml").unwrap();
        assert_eq!(d.name, "demo");
        assert_eq!(d.version, "1.0.0");
        assert_eq!(d.python, ">=3.11");
        assert_eq!(d.requirements, "requirements.txt");
        assert_eq!(d.health.interval, 30);
        assert_eq!(d.health.timeout, 5);
        assert_eq!(d.health.max_failures, 3);
        assert!(d.handlers.is_empty());
    }

    #[test]
    fn rejects_invalid_name() {
        let yaml = "name: \"bad name!\"\nclient:\n  module: m\n  class: C\n";
        let d = parse_descriptor(yaml, "model.yaml");
        assert!(d.is_err());
    }

    #[test]
    fn rejects_reserved_handler_name() {
        let yaml = "name: demo\nclient:\n  module: m\n  class: C\nhandlers:\n  - name: ping\n    input: {}\n    output: {}\n";
        let d = parse_descriptor(yaml, "model.yaml");
        assert!(matches!(d, Err(SupervisorError::ConfigInvalid { .. })));
    }

    #[test]
    fn rejects_duplicate_handler_name() {
        let yaml = "name: demo\nclient:\n  module: m\n  class: C\nhandlers:\n  - name: echo\n    input: {}\n    output: {}\n  - name: echo\n    input: {}\n    output: {}\n";
        let d = parse_descriptor(yaml, "model.yaml");
        assert!(d.is_err());
    }

    #[test]
    fn preserves_unknown_top_level_keys() {
        let yaml =
            "name: demo\nclient:\n  module: m\n  class: C\ncustom_field: 42\nnested:\n  a: 1\n";
        let d = parse_descriptor(yaml, "model.yaml").unwrap();
        assert_eq!(d.extra.get("custom_field").unwrap(), 42);
        assert!(d.extra.get("nested").is_some());
    }

    #[test]
    fn round_trips_through_toml() {
        let d = parse_descriptor(minimal_yaml(), "model.yaml").unwrap();
        let serialised = toml::to_string(&d).expect("serialise descriptor");
        let reparsed: ModelDescriptor = toml::from_str(&serialised).expect("reparse descriptor");
        assert_eq!(reparsed.name, d.name);
        assert_eq!(reparsed.client, d.client);
        assert_eq!(reparsed.health, d.health);
    }

    #[test]
    fn finds_descriptor_by_priority() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.toml"), "x").unwrap();
        std::fs::write(dir.path().join("model.yaml"), "y").unwrap();
        let found = find_descriptor(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "model.yaml");
    }
}
