//! Request routing: domains, conditions, health checks and backends

use reconcile::Component;
use serde::{Deserialize, Serialize};

/// A hostname served by the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    #[serde(default)]
    pub comment: Option<String>,
}

impl Component for Domain {
    const KEY: &'static str = "domain";
    const COLLECTION: &'static str = "domains";
    const DESCRIPTION: &'static str = "Hostnames served by the service";
    const FIELDS: &'static [&'static str] = &["name", "comment"];

    fn check(&self) -> Result<(), String> {
        if self.name.is_empty() || self.name.contains(char::is_whitespace) {
            return Err(format!("`{}` is not a valid hostname", self.name));
        }
        if self.name.contains("://") {
            return Err(format!("`{}` must be a bare hostname, without a scheme", self.name));
        }
        Ok(())
    }
}

const CONDITION_TYPES: &[&str] = &["REQUEST", "RESPONSE", "CACHE", "PREFETCH"];

fn default_condition_type() -> String {
    "REQUEST".to_string()
}

/// A named VCL expression other components refer to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    pub statement: String,
    #[serde(rename = "type", default = "default_condition_type")]
    pub condition_type: String,
    #[serde(default)]
    pub priority: Option<u32>,
}

impl Component for Condition {
    const KEY: &'static str = "condition";
    const COLLECTION: &'static str = "conditions";
    const DESCRIPTION: &'static str = "Named VCL conditions";
    const FIELDS: &'static [&'static str] = &["name", "statement", "type", "priority"];

    fn check(&self) -> Result<(), String> {
        if !CONDITION_TYPES.contains(&self.condition_type.as_str()) {
            return Err(format!(
                "unknown condition type `{}` (expected one of: {})",
                self.condition_type,
                CONDITION_TYPES.join(", ")
            ));
        }
        if self.statement.trim().is_empty() {
            return Err("statement cannot be empty".to_string());
        }
        Ok(())
    }
}

/// Health check used to mark backends healthy or sick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Healthcheck {
    pub name: String,
    pub host: String,
    pub path: String,
    #[serde(default)]
    pub check_interval: Option<u32>,
    #[serde(default)]
    pub threshold: Option<u32>,
    #[serde(default)]
    pub window: Option<u32>,
}

impl Component for Healthcheck {
    const KEY: &'static str = "healthcheck";
    const COLLECTION: &'static str = "healthchecks";
    const DESCRIPTION: &'static str = "Backend health checks";
    const FIELDS: &'static [&'static str] = &[
        "name",
        "host",
        "path",
        "check_interval",
        "threshold",
        "window",
    ];

    fn check(&self) -> Result<(), String> {
        if !self.path.starts_with('/') {
            return Err(format!("path `{}` must start with `/`", self.path));
        }
        if let (Some(threshold), Some(window)) = (self.threshold, self.window)
            && threshold > window
        {
            return Err(format!("threshold {threshold} exceeds window {window}"));
        }
        Ok(())
    }
}

/// An origin server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub override_host: Option<String>,
    /// Name of a declared health check
    #[serde(default)]
    pub healthcheck: Option<String>,
    #[serde(default)]
    pub weight: Option<u32>,
}

impl Component for Backend {
    const KEY: &'static str = "backend";
    const COLLECTION: &'static str = "backends";
    const DESCRIPTION: &'static str = "Origin servers";
    const FIELDS: &'static [&'static str] = &[
        "name",
        "address",
        "port",
        "use_ssl",
        "override_host",
        "healthcheck",
        "weight",
    ];
    const DEPENDS_ON: &'static [&'static str] = &["healthcheck"];

    fn check(&self) -> Result<(), String> {
        if self.address.trim().is_empty() {
            return Err("address cannot be empty".to_string());
        }
        if self.port == Some(0) {
            return Err("port 0 is not a valid port".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::collection::normalize;
    use serde_json::json;

    fn record(value: serde_json::Value) -> reconcile::Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_domain_rejects_urls() {
        let err = normalize::<Domain>(&record(json!({"name": "https://www.example.com"})));
        assert!(err.is_err());
        assert!(normalize::<Domain>(&record(json!({"name": "www.example.com"}))).is_ok());
    }

    #[test]
    fn test_condition_type_defaults_to_request() {
        let normalized =
            normalize::<Condition>(&record(json!({"name": "is_api", "statement": "req.url ~ \"^/api\""})))
                .unwrap();
        assert_eq!(normalized["type"], json!("REQUEST"));
        assert_eq!(normalized["priority"], json!(null));
    }

    #[test]
    fn test_condition_type_is_checked() {
        let result = normalize::<Condition>(&record(
            json!({"name": "x", "statement": "true", "type": "SOMETIMES"}),
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_healthcheck_threshold_within_window() {
        let result = normalize::<Healthcheck>(&record(json!({
            "name": "hc", "host": "origin", "path": "/health", "threshold": 5, "window": 3
        })));
        assert!(result.is_err());
    }

    #[test]
    fn test_backend_normalizes_defaults() {
        let normalized = normalize::<Backend>(&record(
            json!({"name": "origin", "address": "origin.example.com"}),
        ))
        .unwrap();
        assert_eq!(normalized["use_ssl"], json!(false));
        assert_eq!(normalized["port"], json!(null));
        assert!(normalize::<Backend>(&record(json!({"name": "o", "address": "a", "port": 0}))).is_err());
    }
}
