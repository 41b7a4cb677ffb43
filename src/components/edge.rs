//! Edge logic: header rewrites and VCL snippets

use reconcile::Component;
use serde::{Deserialize, Serialize};

const HEADER_ACTIONS: &[&str] = &["set", "append", "delete", "regex", "regex_repeat"];
const HEADER_TYPES: &[&str] = &["request", "cache", "response"];

/// A header rewrite rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub action: String,
    #[serde(rename = "type")]
    pub header_type: String,
    /// Header to write
    pub dst: String,
    /// Expression producing the value; unused for `delete`
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub request_condition: Option<String>,
    #[serde(default)]
    pub cache_condition: Option<String>,
    #[serde(default)]
    pub response_condition: Option<String>,
    #[serde(default)]
    pub priority: Option<u32>,
}

impl Component for Header {
    const KEY: &'static str = "header";
    const COLLECTION: &'static str = "headers";
    const DESCRIPTION: &'static str = "Header rewrite rules";
    const FIELDS: &'static [&'static str] = &[
        "name",
        "action",
        "type",
        "dst",
        "src",
        "request_condition",
        "cache_condition",
        "response_condition",
        "priority",
    ];
    const DEPENDS_ON: &'static [&'static str] = &["condition"];

    fn check(&self) -> Result<(), String> {
        if !HEADER_ACTIONS.contains(&self.action.as_str()) {
            return Err(format!(
                "unknown action `{}` (expected one of: {})",
                self.action,
                HEADER_ACTIONS.join(", ")
            ));
        }
        if !HEADER_TYPES.contains(&self.header_type.as_str()) {
            return Err(format!(
                "unknown type `{}` (expected one of: {})",
                self.header_type,
                HEADER_TYPES.join(", ")
            ));
        }
        if self.action != "delete" && self.src.is_none() {
            return Err(format!("action `{}` requires `src`", self.action));
        }
        Ok(())
    }
}

const SNIPPET_TYPES: &[&str] = &[
    "init", "recv", "hash", "hit", "miss", "pass", "fetch", "error", "deliver", "log", "none",
];

/// A block of raw VCL inserted at a subroutine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snippet {
    pub name: String,
    #[serde(rename = "type")]
    pub snippet_type: String,
    pub content: String,
    #[serde(default)]
    pub priority: Option<u32>,
}

impl Component for Snippet {
    const KEY: &'static str = "snippet";
    const COLLECTION: &'static str = "snippets";
    const DESCRIPTION: &'static str = "VCL snippets";
    const FIELDS: &'static [&'static str] = &["name", "type", "content", "priority"];

    fn check(&self) -> Result<(), String> {
        if SNIPPET_TYPES.contains(&self.snippet_type.as_str()) {
            Ok(())
        } else {
            Err(format!("unknown snippet type `{}`", self.snippet_type))
        }
    }
}
