//! Untyped records and the accessor layer around them
//!
//! A [`Record`] is the currency of the set-diff engine: one element of a
//! declared collection (one backend, one header rule, ...). Concrete
//! sub-resources keep their own typed structs and only pass through this
//! representation for identity extraction and field-level diffing.

use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// One element of a collection, keyed by field name
pub type Record = Map<String, Value>;

/// Read the identity of a record from a scalar field.
///
/// Strings are used as-is, numbers and booleans by their JSON rendering.
/// An empty string is a valid identity.
pub fn identity_of(record: &Record, field: &str) -> Result<String> {
    let reason = match record.get(field) {
        Some(Value::String(s)) => return Ok(s.clone()),
        Some(Value::Number(n)) => return Ok(n.to_string()),
        Some(Value::Bool(b)) => return Ok(b.to_string()),
        Some(Value::Null) => "field is null",
        Some(Value::Array(_) | Value::Object(_)) => "field is not a scalar",
        None => "field is missing",
    };
    Err(Error::Identity {
        field: field.to_string(),
        reason: reason.to_string(),
    })
}

/// Identity built from several fields, joined with `|`.
///
/// The first field is required like in [`identity_of`]; later fields may be
/// unset and count as empty. Trailing empty parts are dropped, so a single
/// field yields the same identity as [`identity_of`].
pub fn composite_identity(record: &Record, fields: &[&str]) -> Result<String> {
    let Some((first, rest)) = fields.split_first() else {
        return Err(Error::Identity {
            field: String::new(),
            reason: "no identity fields".to_string(),
        });
    };
    let mut parts = vec![identity_of(record, first)?];
    for field in rest {
        let part = match record.get(*field) {
            None | Some(Value::Null) => String::new(),
            Some(_) => identity_of(record, field)?,
        };
        parts.push(part);
    }
    while parts.len() > 1 && parts.last().is_some_and(String::is_empty) {
        parts.pop();
    }
    Ok(parts.join("|"))
}

/// Convert a typed value into a record.
pub fn to_record<T: Serialize>(kind: &str, value: &T) -> Result<Record> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::Record {
            kind: kind.to_string(),
            identity: String::new(),
            reason: format!("expected an object, got {}", type_name(&other)),
        }),
        Err(e) => Err(Error::Record {
            kind: kind.to_string(),
            identity: String::new(),
            reason: e.to_string(),
        }),
    }
}

/// Convert a record into its typed form.
///
/// `identity_field` is only used to label the error.
pub fn from_record<T: DeserializeOwned>(
    kind: &str,
    identity_field: &str,
    record: &Record,
) -> Result<T> {
    serde_json::from_value(Value::Object(record.clone())).map_err(|e| Error::Record {
        kind: kind.to_string(),
        identity: identity_of(record, identity_field).unwrap_or_default(),
        reason: e.to_string(),
    })
}

/// Read a collection out of a state value.
///
/// Absent and `null` values are empty collections.
pub fn records_from_value(key: &str, value: Option<&Value>) -> Result<Vec<Record>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(map) => Ok(map.clone()),
                other => Err(Error::State {
                    key: key.to_string(),
                    reason: format!("element {i} is {}, expected a table", type_name(other)),
                }),
            })
            .collect(),
        Some(other) => Err(Error::State {
            key: key.to_string(),
            reason: format!("expected a list, got {}", type_name(other)),
        }),
    }
}

/// Turn a collection back into a state value.
pub fn records_to_value(records: &[Record]) -> Value {
    Value::Array(records.iter().cloned().map(Value::Object).collect())
}

/// Name of a JSON value's type, for error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a table",
    }
}
