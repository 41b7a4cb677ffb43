//! Typed collection handlers
//!
//! A [`Component`] is the strongly-typed struct of one sub-resource member.
//! [`TypedCollection`] maps it onto the per-item CRUD endpoints and
//! [`BatchCollection`] onto the bulk endpoint. Records only appear at the
//! edges, for identity extraction and field diffing.

use crate::batch::{self, DEFAULT_MAX_BATCH_SIZE};
use crate::context::VersionContext;
use crate::diff::{DiffResult, SetDiff};
use crate::error::{Error, Result};
use crate::handler::{AttributeHandler, CrudHandler};
use crate::record::{Record, from_record, identity_of, records_to_value, to_record};
use crate::schema::{FieldSpec, Schema};
use crate::state::ResourceData;
use crate::types::Version;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;

/// A typed member of a sub-resource collection
pub trait Component: Serialize + DeserializeOwned {
    /// State key of the collection
    const KEY: &'static str;
    /// Remote collection name
    const COLLECTION: &'static str;
    const DESCRIPTION: &'static str;
    /// Fields a declared member may carry
    const FIELDS: &'static [&'static str];
    /// Field required on every member and named in identity errors
    const IDENTITY: &'static str = "name";
    const DEPENDS_ON: &'static [&'static str] = &[];

    /// Identity of a member.
    ///
    /// The [`Component::IDENTITY`] field unless overridden; members with
    /// the same identity are the same remote object.
    fn identity(record: &Record) -> Result<String> {
        identity_of(record, Self::IDENTITY)
    }

    /// Checks beyond what deserialization enforces
    fn check(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Round-trip a record through its typed form.
///
/// Unknown remote fields are dropped and unset optionals become `null`.
pub fn normalize<C: Component>(record: &Record) -> Result<Record> {
    let typed: C = from_record(C::KEY, C::IDENTITY, record)?;
    typed.check().map_err(|reason| Error::Record {
        kind: C::KEY.to_string(),
        identity: C::identity(record).unwrap_or_default(),
        reason,
    })?;
    to_record(C::KEY, &typed)
}

fn schema_of<C: Component>() -> FieldSpec {
    FieldSpec::collection(C::KEY, C::DESCRIPTION, C::IDENTITY, C::FIELDS)
}

fn list<C: Component>(ctx: &VersionContext<'_>) -> Result<Vec<Record>> {
    ctx.transport
        .list_items(ctx.target, C::COLLECTION)?
        .iter()
        .map(normalize::<C>)
        .collect()
}

/// Per-item CRUD handler for a [`Component`]
pub struct TypedCollection<C> {
    _component: PhantomData<fn() -> C>,
}

impl<C: Component> TypedCollection<C> {
    pub fn new() -> Self {
        Self {
            _component: PhantomData,
        }
    }
}

impl<C: Component> Default for TypedCollection<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for TypedCollection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedCollection").finish()
    }
}

impl<C: Component + 'static> CrudHandler for TypedCollection<C> {
    fn key(&self) -> &'static str {
        C::KEY
    }

    fn identity_field(&self) -> &'static str {
        C::IDENTITY
    }

    fn diff_engine(&self) -> SetDiff {
        SetDiff::new(C::identity)
    }

    fn depends_on(&self) -> &'static [&'static str] {
        C::DEPENDS_ON
    }

    fn get_schema(&self) -> FieldSpec {
        schema_of::<C>()
    }

    fn normalize(&self, record: &Record) -> Result<Record> {
        normalize::<C>(record)
    }

    fn create(&self, ctx: &VersionContext<'_>, record: &Record) -> Result<()> {
        ctx.transport.create_item(ctx.target, C::COLLECTION, record)?;
        Ok(())
    }

    fn read(&self, ctx: &VersionContext<'_>) -> Result<Vec<Record>> {
        list::<C>(ctx)
    }

    fn update(
        &self,
        ctx: &VersionContext<'_>,
        identity: &str,
        changes: &Record,
        _record: &Record,
    ) -> Result<()> {
        ctx.transport
            .update_item(ctx.target, C::COLLECTION, identity, changes)?;
        Ok(())
    }

    fn delete(&self, ctx: &VersionContext<'_>, identity: &str, _record: &Record) -> Result<()> {
        ctx.transport
            .delete_item(ctx.target, C::COLLECTION, identity)?;
        Ok(())
    }
}

/// Bulk handler for a [`Component`], for collections too large for
/// one call per member
pub struct BatchCollection<C> {
    max_batch_size: usize,
    _component: PhantomData<fn() -> C>,
}

impl<C: Component + 'static> BatchCollection<C> {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size,
            _component: PhantomData,
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Diff of observed against declared members, both normalized
    pub fn diff(&self, state: &ResourceData) -> Result<DiffResult> {
        let (old, new) = state.get_records_change(C::KEY)?;
        let old = old.iter().map(normalize::<C>).collect::<Result<Vec<_>>>()?;
        let new = new.iter().map(normalize::<C>).collect::<Result<Vec<_>>>()?;
        let engine = SetDiff::new(C::identity);
        engine.sorted(engine.diff(&old, &new)?)
    }
}

impl<C: Component + 'static> Default for BatchCollection<C> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BATCH_SIZE)
    }
}

impl<C: Component + 'static> AttributeHandler for BatchCollection<C> {
    fn key(&self) -> &'static str {
        C::KEY
    }

    fn depends_on(&self) -> &'static [&'static str] {
        C::DEPENDS_ON
    }

    fn register(&self, schema: &mut Schema) {
        schema.register(schema_of::<C>());
    }

    fn read(
        &self,
        ctx: &VersionContext<'_>,
        snapshot: &Version,
        state: &mut ResourceData,
    ) -> Result<()> {
        let records = list::<C>(ctx)?;
        log::debug!(
            "Read {} {} record(s) from version {}",
            records.len(),
            C::KEY,
            snapshot.number
        );
        state.set(C::KEY, records_to_value(&records));
        Ok(())
    }

    fn process(&self, ctx: &VersionContext<'_>, state: &mut ResourceData) -> Result<()> {
        let diff = self.diff(state)?;
        log::info!("{}: {} on {}", C::KEY, diff.summary(), ctx.target);

        let operations = batch::operations_from_diff(&diff, C::identity)?;
        batch::dispatch(&operations, self.max_batch_size, |chunk| {
            ctx.transport
                .batch_modify(ctx.target, C::COLLECTION, chunk)
                .map_err(|source| Error::Mutation {
                    handler: C::KEY.to_string(),
                    identity: batch::chunk_label(chunk),
                    version: ctx.version(),
                    source,
                })
        })
    }

    fn has_change(&self, state: &ResourceData) -> bool {
        self.diff(state).map(|d| d.has_changes()).unwrap_or(true)
    }

    fn preview(&self, state: &ResourceData) -> Result<Option<DiffResult>> {
        self.diff(state).map(Some)
    }
}
