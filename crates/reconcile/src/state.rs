//! Declared and observed state for one service
//!
//! The declared side comes from configuration; the observed side is what the
//! last successful run (or refresh) saw remotely. Handlers read the pair to
//! decide what changed and write observations back with [`ResourceData::set`].

use crate::error::{Error, Result};
use crate::record::{Record, records_from_value, type_name};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Declared/observed state container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceData {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    declared: Map<String, Value>,
    #[serde(default)]
    observed: Map<String, Value>,
}

impl ResourceData {
    /// State with only a declared side
    pub fn new(declared: Map<String, Value>) -> Self {
        Self {
            id: None,
            declared,
            observed: Map::new(),
        }
    }

    /// State restored from a previous run
    pub fn with_observed(
        id: Option<String>,
        declared: Map<String, Value>,
        observed: Map<String, Value>,
    ) -> Self {
        Self {
            id,
            declared,
            observed,
        }
    }

    /// Remote identifier of the service, once created
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn set_id(&mut self, id: Option<String>) {
        self.id = id;
    }

    pub fn declared(&self) -> &Map<String, Value> {
        &self.declared
    }

    pub fn observed(&self) -> &Map<String, Value> {
        &self.observed
    }

    /// Current value of `key`: declared if present, otherwise observed.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.declared
            .get(key)
            .filter(|v| !v.is_null())
            .or_else(|| self.observed.get(key))
    }

    /// Observed value of `key`
    pub fn get_observed(&self, key: &str) -> Option<&Value> {
        self.observed.get(key)
    }

    /// `(observed, declared)` values of `key`
    pub fn get_change(&self, key: &str) -> (Option<&Value>, Option<&Value>) {
        (self.observed.get(key), self.declared.get(key))
    }

    /// Record an observed value
    pub fn set(&mut self, key: &str, value: Value) {
        self.observed.insert(key.to_string(), value);
    }

    /// Forget an observed value
    pub fn unset(&mut self, key: &str) {
        self.observed.remove(key);
    }

    /// Whether the declared value of `key` differs from the observed one.
    ///
    /// Missing, `null` and empty-list values are all "unset" and compare equal.
    pub fn has_change(&self, key: &str) -> bool {
        normalize(self.observed.get(key)) != normalize(self.declared.get(key))
    }

    /// Adopt the declared value of `key` as observed
    pub fn commit(&mut self, key: &str) {
        match self.declared.get(key) {
            Some(value) if !value.is_null() => {
                self.observed.insert(key.to_string(), value.clone());
            }
            _ => {
                self.observed.remove(key);
            }
        }
    }

    /// `(observed, declared)` collections stored under `key`
    pub fn get_records_change(&self, key: &str) -> Result<(Vec<Record>, Vec<Record>)> {
        let (old, new) = self.get_change(key);
        Ok((records_from_value(key, old)?, records_from_value(key, new)?))
    }

    /// Current string value of `key`
    pub fn get_str(&self, key: &str) -> Result<Option<&str>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(wrong_type(key, "a string", other)),
        }
    }

    /// Current boolean value of `key`, or `default` when unset
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(wrong_type(key, "a boolean", other)),
        }
    }

    /// Observed version number stored under `key`; zero means unset
    pub fn get_version(&self, key: &str) -> Result<Option<u32>> {
        match self.observed.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => match n.as_u64().map(u32::try_from) {
                Some(Ok(0)) => Ok(None),
                Some(Ok(v)) => Ok(Some(v)),
                _ => Err(wrong_type(key, "a version number", &Value::Number(n.clone()))),
            },
            Some(other) => Err(wrong_type(key, "a version number", other)),
        }
    }
}

fn normalize(value: Option<&Value>) -> Option<&Value> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) if items.is_empty() => None,
        Some(Value::Object(map)) if map.is_empty() => None,
        other => other,
    }
}

fn wrong_type(key: &str, expected: &str, got: &Value) -> Error {
    Error::State {
        key: key.to_string(),
        reason: format!("expected {expected}, got {}", type_name(got)),
    }
}
