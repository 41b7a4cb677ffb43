//! Schema of declared state keys
//!
//! Every attribute handler registers the key it owns. Declared state is
//! checked against the registered schema before a version is built, so a
//! typo in a configuration file fails fast instead of silently being ignored.

use crate::error::{Error, Result};
use crate::record::type_name;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Service-level state keys
pub mod keys {
    pub const NAME: &str = "name";
    pub const COMMENT: &str = "comment";
    pub const TYPE: &str = "type";
    pub const VERSION_COMMENT: &str = "version_comment";
    pub const ACTIVATE: &str = "activate";
    pub const FORCE_DESTROY: &str = "force_destroy";
    pub const REUSE: &str = "reuse";
    pub const ACTIVE_VERSION: &str = "active_version";
    pub const CLONED_VERSION: &str = "cloned_version";
}

/// Shape of a value stored under a state key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// A single scalar
    Scalar,
    /// A single table of fields
    Block,
    /// A list of tables, each with an identity field
    Collection,
}

/// Declaration of one state key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub key: &'static str,
    pub kind: FieldKind,
    pub description: &'static str,
    /// Allowed member fields for blocks and collections; empty allows any
    pub fields: &'static [&'static str],
    /// Identity field of collection members
    pub identity: Option<&'static str>,
    /// Set by the remote side, never declared
    pub computed: bool,
}

impl FieldSpec {
    pub fn scalar(key: &'static str, description: &'static str) -> Self {
        Self {
            key,
            kind: FieldKind::Scalar,
            description,
            fields: &[],
            identity: None,
            computed: false,
        }
    }

    pub fn computed(key: &'static str, description: &'static str) -> Self {
        Self {
            computed: true,
            ..Self::scalar(key, description)
        }
    }

    pub fn block(
        key: &'static str,
        description: &'static str,
        fields: &'static [&'static str],
    ) -> Self {
        Self {
            kind: FieldKind::Block,
            fields,
            ..Self::scalar(key, description)
        }
    }

    pub fn collection(
        key: &'static str,
        description: &'static str,
        identity: &'static str,
        fields: &'static [&'static str],
    ) -> Self {
        Self {
            kind: FieldKind::Collection,
            fields,
            identity: Some(identity),
            ..Self::scalar(key, description)
        }
    }

    fn check_members(&self, what: &str, table: &Map<String, Value>) -> Result<()> {
        if self.fields.is_empty() {
            return Ok(());
        }
        for field in table.keys() {
            if !self.fields.contains(&field.as_str()) {
                return Err(Error::Schema(format!(
                    "unknown field `{field}` in {what} (expected one of: {})",
                    self.fields.join(", ")
                )));
            }
        }
        Ok(())
    }

    fn validate(&self, value: &Value) -> Result<()> {
        if self.computed {
            return Err(Error::Schema(format!(
                "`{}` is computed and cannot be declared",
                self.key
            )));
        }
        match (self.kind, value) {
            (_, Value::Null) => Ok(()),
            (FieldKind::Scalar, Value::Array(_) | Value::Object(_)) => Err(Error::Schema(format!(
                "`{}` must be a single value, got {}",
                self.key,
                type_name(value)
            ))),
            (FieldKind::Scalar, _) => Ok(()),
            (FieldKind::Block, Value::Object(table)) => {
                self.check_members(&format!("`{}`", self.key), table)
            }
            (FieldKind::Collection, Value::Array(items)) => {
                for (i, item) in items.iter().enumerate() {
                    let Value::Object(table) = item else {
                        return Err(Error::Schema(format!(
                            "`{}` element {i} must be a table, got {}",
                            self.key,
                            type_name(item)
                        )));
                    };
                    if let Some(identity) = self.identity
                        && !table.contains_key(identity)
                    {
                        return Err(Error::Schema(format!(
                            "`{}` element {i} is missing its `{identity}` field",
                            self.key
                        )));
                    }
                    self.check_members(&format!("`{}` element {i}", self.key), table)?;
                }
                Ok(())
            }
            (FieldKind::Block, _) => Err(Error::Schema(format!(
                "`{}` must be a table, got {}",
                self.key,
                type_name(value)
            ))),
            (FieldKind::Collection, _) => Err(Error::Schema(format!(
                "`{}` must be a list of tables, got {}",
                self.key,
                type_name(value)
            ))),
        }
    }
}

/// Registered state keys
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: BTreeMap<&'static str, FieldSpec>,
}

impl Schema {
    /// Empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema with the service-level keys every service has
    pub fn with_service_fields() -> Self {
        let mut schema = Self::new();
        schema.register(FieldSpec::scalar(keys::NAME, "Service name"));
        schema.register(FieldSpec::scalar(keys::COMMENT, "Service description"));
        schema.register(FieldSpec::scalar(keys::TYPE, "Service type: vcl or compute"));
        schema.register(FieldSpec::scalar(
            keys::VERSION_COMMENT,
            "Comment attached to the version being built",
        ));
        schema.register(FieldSpec::scalar(
            keys::ACTIVATE,
            "Activate the built version (default: true)",
        ));
        schema.register(FieldSpec::scalar(
            keys::FORCE_DESTROY,
            "Deactivate the active version before deleting the service",
        ));
        schema.register(FieldSpec::scalar(
            keys::REUSE,
            "On delete, only deactivate; keep the service",
        ));
        schema.register(FieldSpec::computed(
            keys::ACTIVE_VERSION,
            "Version currently serving traffic",
        ));
        schema.register(FieldSpec::computed(
            keys::CLONED_VERSION,
            "Latest version built by this tool",
        ));
        schema
    }

    /// Register a key; re-registering replaces the earlier declaration
    pub fn register(&mut self, spec: FieldSpec) {
        self.fields.insert(spec.key, spec);
    }

    pub fn get(&self, key: &str) -> Option<&FieldSpec> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Iterate registered keys in name order
    pub fn iter(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.values()
    }

    /// Keys holding collections
    pub fn collections(&self) -> impl Iterator<Item = &FieldSpec> {
        self.iter().filter(|f| f.kind == FieldKind::Collection)
    }

    /// Check declared state against the registered keys
    pub fn validate(&self, declared: &Map<String, Value>) -> Result<()> {
        for (key, value) in declared {
            match self.fields.get(key.as_str()) {
                Some(spec) => spec.validate(value)?,
                None => {
                    return Err(Error::Schema(format!(
                        "unknown key `{key}` for this service type"
                    )));
                }
            }
        }
        Ok(())
    }
}
