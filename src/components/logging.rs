//! Log streaming endpoints

use reconcile::Component;
use serde::{Deserialize, Serialize};

const DEFAULT_FORMAT: &str = "%h %l %u %t \"%r\" %>s %b";

fn default_format() -> Option<String> {
    Some(DEFAULT_FORMAT.to_string())
}

/// A syslog endpoint receiving request logs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Syslog {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_format")]
    pub format: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
    /// Only log responses matching this condition
    #[serde(default)]
    pub response_condition: Option<String>,
}

impl Component for Syslog {
    const KEY: &'static str = "logging_syslog";
    const COLLECTION: &'static str = "logging/syslog";
    const DESCRIPTION: &'static str = "Syslog logging endpoints";
    const FIELDS: &'static [&'static str] = &[
        "name",
        "address",
        "port",
        "format",
        "use_tls",
        "response_condition",
    ];
    const DEPENDS_ON: &'static [&'static str] = &["condition"];

    fn check(&self) -> Result<(), String> {
        if self.address.trim().is_empty() {
            return Err("address cannot be empty".to_string());
        }
        if self.format.as_deref().is_some_and(|f| f.trim().is_empty()) {
            return Err("format cannot be empty".to_string());
        }
        Ok(())
    }
}
