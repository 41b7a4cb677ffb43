use anyhow::{Context, Result};
use reconcile::{ServiceType, keys};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

// ============================================================================
// Service File Schema
// ============================================================================

/// A service definition file.
///
/// The `[service]` table holds service-level settings; every other top-level
/// key is a sub-resource block or collection, checked later against the
/// handlers registered for the service type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceFile {
    pub service: ServiceSection,

    #[serde(flatten)]
    pub resources: toml::Table,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSection {
    pub name: String,

    #[serde(rename = "type", default)]
    pub service_type: ServiceType,

    #[serde(default)]
    pub comment: Option<String>,

    /// Comment attached to the version being built
    #[serde(default)]
    pub version_comment: Option<String>,

    /// Activate the built version (default: true)
    #[serde(default)]
    pub activate: Option<bool>,

    /// Deactivate the active version before deleting
    #[serde(default)]
    pub force_destroy: Option<bool>,

    /// On destroy, only deactivate and keep the service
    #[serde(default)]
    pub reuse: Option<bool>,

    /// Name of the recorded state; defaults to the file's own path
    #[serde(default)]
    pub state_key: Option<String>,
}

impl ServiceFile {
    /// Load a service definition from disk
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read service file: {}", path.display()))?;
        let file = Self::parse(&content)
            .with_context(|| format!("Invalid service file: {}", path.display()))?;
        log::debug!("Loaded service {} from {}", file.service.name, path.display());
        Ok(file)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: Self = toml::from_str(content).context("Invalid TOML format")?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            anyhow::bail!("[service] name cannot be empty");
        }
        if self
            .service
            .state_key
            .as_deref()
            .is_some_and(|key| key.trim().is_empty())
        {
            anyhow::bail!("[service] state_key cannot be empty");
        }
        if let Some(key) = self.resources.keys().find(|k| is_service_key(k)) {
            anyhow::bail!("`{key}` belongs in the [service] table");
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.service.name
    }

    /// Key the recorded state is stored under.
    ///
    /// Independent of the service name, so renaming a service updates it
    /// in place rather than creating a second one.
    pub fn state_key(&self, path: &Path) -> Result<String> {
        if let Some(key) = &self.service.state_key {
            return Ok(key.clone());
        }
        let path = path
            .canonicalize()
            .with_context(|| format!("Could not resolve service file: {}", path.display()))?;
        Ok(path.to_string_lossy().into_owned())
    }

    /// Flatten into the declared side of the service state
    pub fn declared(&self) -> Result<Map<String, Value>> {
        let service = &self.service;
        let mut declared = Map::new();
        declared.insert(keys::NAME.into(), Value::String(service.name.clone()));
        declared.insert(
            keys::TYPE.into(),
            Value::String(service.service_type.as_str().to_string()),
        );
        let optional = [
            (keys::COMMENT, service.comment.clone().map(Value::String)),
            (
                keys::VERSION_COMMENT,
                service.version_comment.clone().map(Value::String),
            ),
            (keys::ACTIVATE, service.activate.map(Value::Bool)),
            (keys::FORCE_DESTROY, service.force_destroy.map(Value::Bool)),
            (keys::REUSE, service.reuse.map(Value::Bool)),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                declared.insert(key.into(), value);
            }
        }
        for (key, value) in &self.resources {
            let value = serde_json::to_value(value)
                .with_context(|| format!("Could not convert `{key}`"))?;
            declared.insert(key.clone(), value);
        }
        Ok(declared)
    }
}

const STATE_KEY: &str = "state_key";

fn is_service_key(key: &str) -> bool {
    [
        keys::NAME,
        keys::TYPE,
        keys::COMMENT,
        keys::VERSION_COMMENT,
        keys::ACTIVATE,
        keys::FORCE_DESTROY,
        keys::REUSE,
        STATE_KEY,
    ]
    .contains(&key)
}

// ============================================================================
// Tests
// ============================================================================
