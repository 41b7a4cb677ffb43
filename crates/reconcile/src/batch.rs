//! Chunked dispatch of bulk remote mutations

use crate::diff::DiffResult;
use crate::error::{Error, Result};
use crate::record::Record;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest chunk the remote bulk endpoints accept
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

/// Kind of bulk mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOp {
    Create,
    Update,
    Delete,
}

impl fmt::Display for BatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BatchOp::Create => "create",
            BatchOp::Update => "update",
            BatchOp::Delete => "delete",
        })
    }
}

/// One instruction in a bulk mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOperation {
    pub op: BatchOp,
    pub identity: String,
    pub payload: Record,
}

impl BatchOperation {
    pub fn create(identity: impl Into<String>, payload: Record) -> Self {
        Self {
            op: BatchOp::Create,
            identity: identity.into(),
            payload,
        }
    }

    pub fn update(identity: impl Into<String>, payload: Record) -> Self {
        Self {
            op: BatchOp::Update,
            identity: identity.into(),
            payload,
        }
    }

    pub fn delete(identity: impl Into<String>) -> Self {
        Self {
            op: BatchOp::Delete,
            identity: identity.into(),
            payload: Record::new(),
        }
    }
}

/// Run `execute` once per contiguous chunk of at most `max_batch_size`
/// operations, in order, stopping at the first error.
///
/// Chunks submitted before a failure are not rolled back.
pub fn dispatch<F>(operations: &[BatchOperation], max_batch_size: usize, mut execute: F) -> Result<()>
where
    F: FnMut(&[BatchOperation]) -> Result<()>,
{
    if max_batch_size == 0 {
        return Err(Error::InvalidBatchSize);
    }

    let total = operations.len().div_ceil(max_batch_size);
    for (i, chunk) in operations.chunks(max_batch_size).enumerate() {
        log::debug!(
            "Dispatching batch {}/{} ({} operations)",
            i + 1,
            total,
            chunk.len()
        );
        execute(chunk)?;
    }
    Ok(())
}

/// Turn a diff into bulk operations: deletes, then creates, then updates.
///
/// `identity_of` must be the key function the diff was computed with.
/// Modified entries with no changed field produce no operation.
pub fn operations_from_diff<F>(diff: &DiffResult, mut identity_of: F) -> Result<Vec<BatchOperation>>
where
    F: FnMut(&Record) -> Result<String>,
{
    let mut ops = Vec::with_capacity(diff.added.len() + diff.deleted.len() + diff.modified.len());
    for record in &diff.deleted {
        ops.push(BatchOperation::delete(identity_of(record)?));
    }
    for record in &diff.added {
        ops.push(BatchOperation::create(identity_of(record)?, record.clone()));
    }
    for modified in diff.changed() {
        ops.push(BatchOperation::update(
            modified.identity.clone(),
            modified.changes.clone(),
        ));
    }
    Ok(ops)
}

/// Human-readable label for a chunk, e.g. `10.0.0.1..10.0.0.9 (9 operations)`
pub fn chunk_label(chunk: &[BatchOperation]) -> String {
    match (chunk.first(), chunk.last()) {
        (Some(first), Some(last)) if chunk.len() > 1 => format!(
            "{}..{} ({} operations)",
            first.identity,
            last.identity,
            chunk.len()
        ),
        (Some(only), _) => only.identity.clone(),
        _ => String::from("(empty batch)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::SetDiff;
    use crate::record::identity_of;
    use crate::TransportError;
    use serde_json::json;

    fn ops(n: usize) -> Vec<BatchOperation> {
        (0..n).map(|i| BatchOperation::delete(format!("op{i}"))).collect()
    }

    #[test]
    fn test_dispatch_chunk_count() {
        for (n, b, expected) in [(10, 3, 4), (9, 3, 3), (1, 1000, 1), (1000, 1000, 1), (1001, 1000, 2)] {
            let mut calls = 0;
            dispatch(&ops(n), b, |chunk| {
                assert!(chunk.len() <= b);
                calls += 1;
                Ok(())
            })
            .unwrap();
            assert_eq!(calls, expected, "n={n} b={b}");
        }
    }

    #[test]
    fn test_dispatch_preserves_order_without_duplicates() {
        let input = ops(7);
        let mut seen = Vec::new();
        dispatch(&input, 3, |chunk| {
            seen.extend(chunk.iter().cloned());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, input);
    }

    #[test]
    fn test_dispatch_empty_is_noop() {
        let mut called = false;
        dispatch(&[], 5, |_| {
            called = true;
            Ok(())
        })
        .unwrap();
        assert!(!called);
    }

    #[test]
    fn test_dispatch_stops_on_first_error() {
        let mut calls = 0;
        let result = dispatch(&ops(10), 2, |_| {
            calls += 1;
            if calls == 2 {
                Err(TransportError::rejected("too many entries").into())
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_dispatch_rejects_zero_batch_size() {
        let result = dispatch(&ops(1), 0, |_| Ok(()));
        assert!(matches!(result, Err(Error::InvalidBatchSize)));
    }

    #[test]
    fn test_operations_from_diff() {
        let old = vec![
            json!({"ip": "10.0.0.1", "negated": false}),
            json!({"ip": "10.0.0.2", "negated": false}),
            json!({"ip": "10.0.0.3", "negated": false}),
        ];
        let new = vec![
            json!({"ip": "10.0.0.2", "negated": true}),
            json!({"ip": "10.0.0.3", "negated": false}),
            json!({"ip": "10.0.0.4", "negated": false}),
        ];
        let to_records = |v: Vec<serde_json::Value>| -> Vec<Record> {
            v.into_iter().map(|x| x.as_object().cloned().unwrap()).collect()
        };
        let diff = SetDiff::by_field("ip")
            .diff(&to_records(old), &to_records(new))
            .unwrap();
        let ops = operations_from_diff(&diff, |r| identity_of(r, "ip")).unwrap();

        let summary: Vec<(BatchOp, &str)> =
            ops.iter().map(|o| (o.op, o.identity.as_str())).collect();
        assert_eq!(
            summary,
            vec![
                (BatchOp::Delete, "10.0.0.1"),
                (BatchOp::Create, "10.0.0.4"),
                (BatchOp::Update, "10.0.0.2"),
            ]
        );
    }

    #[test]
    fn test_chunk_label() {
        assert_eq!(chunk_label(&ops(1)), "op0");
        assert_eq!(chunk_label(&ops(3)), "op0..op2 (3 operations)");
        assert_eq!(chunk_label(&[]), "(empty batch)");
    }
}
