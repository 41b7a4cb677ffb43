//! Identity-keyed set diff for declared collections
//!
//! Collections are unordered: two records are "the same element" when their
//! identity keys match, regardless of position. A diff splits old and new
//! collections into added, deleted and modified partitions; modified entries
//! carry only the fields whose value changed.

use crate::error::Result;
use crate::record::{Record, identity_of};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Reduces a record to its identity key
pub type KeyFn = Box<dyn Fn(&Record) -> Result<String> + Send + Sync>;

/// A record present on both sides of a diff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modified {
    /// Identity shared by the old and new record
    pub identity: String,
    /// The complete new record
    pub record: Record,
    /// Fields whose value differs from the old record
    pub changes: Record,
}

impl Modified {
    /// Whether no field actually changed
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Result of diffing two collections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    /// Present in new, absent in old
    pub added: Vec<Record>,
    /// Present in old, absent in new
    pub deleted: Vec<Record>,
    /// Present in both, including entries with no changed fields
    pub modified: Vec<Modified>,
}

impl DiffResult {
    /// Whether applying this diff would change anything remotely
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty()
            || !self.deleted.is_empty()
            || self.modified.iter().any(|m| !m.is_noop())
    }

    /// Modified entries that actually changed a field
    pub fn changed(&self) -> impl Iterator<Item = &Modified> {
        self.modified.iter().filter(|m| !m.is_noop())
    }

    /// Summary counts for reporting
    pub fn summary(&self) -> DiffSummary {
        DiffSummary {
            additions: self.added.len(),
            removals: self.deleted.len(),
            modifications: self.changed().count(),
        }
    }
}

/// Diff summary statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffSummary {
    /// Number of records to add
    pub additions: usize,
    /// Number of records to remove
    pub removals: usize,
    /// Number of records with at least one changed field
    pub modifications: usize,
}

impl DiffSummary {
    /// Total number of changes
    pub fn total(&self) -> usize {
        self.additions + self.removals + self.modifications
    }

    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }

    /// Merge another summary into this one
    pub fn merge(&mut self, other: &DiffSummary) {
        self.additions += other.additions;
        self.removals += other.removals;
        self.modifications += other.modifications;
    }
}

impl fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to add, {} to change, {} to remove",
            self.additions, self.modifications, self.removals
        )
    }
}

/// Set-diff engine parameterized by an identity key function
pub struct SetDiff {
    key_fn: KeyFn,
}

impl fmt::Debug for SetDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetDiff").finish_non_exhaustive()
    }
}

impl SetDiff {
    /// Create an engine with a custom key function
    pub fn new<F>(key_fn: F) -> Self
    where
        F: Fn(&Record) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            key_fn: Box::new(key_fn),
        }
    }

    /// Create an engine keyed by a single scalar field
    pub fn by_field(field: &str) -> Self {
        let field = field.to_string();
        Self::new(move |record| identity_of(record, &field))
    }

    /// Identity of a record under this engine's key function
    pub fn identity(&self, record: &Record) -> Result<String> {
        (self.key_fn)(record)
    }

    fn index<'a>(&self, records: &'a [Record]) -> Result<BTreeMap<String, &'a Record>> {
        records
            .iter()
            .map(|record| Ok((self.identity(record)?, record)))
            .collect()
    }

    /// Split `old` and `new` into added, deleted and modified partitions.
    ///
    /// Any record without a usable identity fails the whole call.
    pub fn diff(&self, old: &[Record], new: &[Record]) -> Result<DiffResult> {
        let old_index = self.index(old)?;
        let new_index = self.index(new)?;

        let deleted = old_index
            .iter()
            .filter(|(id, _)| !new_index.contains_key(*id))
            .map(|(_, record)| (*record).clone())
            .collect();

        let mut added = Vec::new();
        let mut modified = Vec::new();
        for (id, record) in &new_index {
            match old_index.get(id) {
                None => added.push((*record).clone()),
                Some(previous) => modified.push(Modified {
                    identity: id.clone(),
                    record: (*record).clone(),
                    changes: changed_fields(record, previous),
                }),
            }
        }

        Ok(DiffResult {
            added,
            deleted,
            modified,
        })
    }

    /// Order every partition of `diff` by identity.
    pub fn sorted(&self, mut diff: DiffResult) -> Result<DiffResult> {
        sort_records(&mut diff.added, |r| self.identity(r))?;
        sort_records(&mut diff.deleted, |r| self.identity(r))?;
        diff.modified.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(diff)
    }

    /// Fields of `new_record` that differ from its counterpart in `old_set`.
    ///
    /// Without a counterpart every field counts as changed.
    pub fn filter(&self, new_record: &Record, old_set: &[Record]) -> Result<Record> {
        let identity = self.identity(new_record)?;
        for old in old_set {
            if self.identity(old)? == identity {
                return Ok(changed_fields(new_record, old));
            }
        }
        Ok(new_record.clone())
    }
}

fn sort_records<F>(records: &mut Vec<Record>, identity: F) -> Result<()>
where
    F: Fn(&Record) -> Result<String>,
{
    let mut keyed = records
        .drain(..)
        .map(|r| Ok((identity(&r)?, r)))
        .collect::<Result<Vec<_>>>()?;
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    records.extend(keyed.into_iter().map(|(_, r)| r));
    Ok(())
}

/// Shallow structural comparison of two records.
///
/// An absent field and an explicit `null` are the same value. Fields only
/// present in `old` are reported as `null`.
fn changed_fields(new: &Record, old: &Record) -> Record {
    let mut changes: Record = new
        .iter()
        .filter(|(key, value)| old.get(*key).unwrap_or(&Value::Null) != *value)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    for (key, value) in old {
        if !new.contains_key(key) && !value.is_null() {
            changes.insert(key.clone(), Value::Null);
        }
    }
    changes
}
