//! Attribute handler protocol
//!
//! An attribute handler owns one category of sub-resource (backends,
//! domains, settings, ...) and takes part in building a version:
//! - Schema registration (the state key it owns)
//! - Read (refresh observed state from a remote version)
//! - Change detection (`has_change` / `must_process`)
//! - Processing (apply the declared change to a draft version)
//!
//! Most sub-resources are plain collections with create/read/update/delete
//! endpoints. Those implement the narrower [`CrudHandler`] and are lifted to
//! the full protocol by [`CrudAdapter`], which diffs the declared collection
//! against the observed one and issues the minimal set of remote calls.

use crate::context::VersionContext;
use crate::diff::{DiffResult, SetDiff};
use crate::error::{Error, Result};
use crate::record::{Record, records_to_value};
use crate::schema::{FieldSpec, Schema};
use crate::state::ResourceData;
use crate::types::Version;

/// Core trait for every sub-resource category of a service
pub trait AttributeHandler {
    /// State key owned by this handler
    fn key(&self) -> &'static str;

    /// Keys of handlers that must run before this one
    ///
    /// Backends referencing conditions, for example, depend on "condition".
    fn depends_on(&self) -> &'static [&'static str] {
        &[]
    }

    /// Declare the owned key in the schema
    fn register(&self, schema: &mut Schema);

    /// Refresh observed state from a remote version snapshot
    fn read(
        &self,
        ctx: &VersionContext<'_>,
        snapshot: &Version,
        state: &mut ResourceData,
    ) -> Result<()>;

    /// Apply the declared change to the draft version in `ctx`
    fn process(&self, ctx: &VersionContext<'_>, state: &mut ResourceData) -> Result<()>;

    /// Whether the declared value differs from the observed one
    fn has_change(&self, state: &ResourceData) -> bool {
        state.has_change(self.key())
    }

    /// Whether this handler must run for the next version
    ///
    /// Defaults to [`AttributeHandler::has_change`]. Override to force
    /// processing under extra conditions, such as explicitly declared values
    /// on the very first version that match the remote defaults.
    fn must_process(&self, state: &ResourceData, is_initial_version: bool) -> bool {
        let _ = is_initial_version;
        self.has_change(state)
    }

    /// Record-level diff the next `process` would apply, for collections
    fn preview(&self, state: &ResourceData) -> Result<Option<DiffResult>> {
        let _ = state;
        Ok(None)
    }
}

/// A boxed handler for type-erased storage
pub type BoxedHandler = Box<dyn AttributeHandler>;

/// Create/read/update/delete contract for collection sub-resources
pub trait CrudHandler {
    /// State key of the collection
    fn key(&self) -> &'static str;

    /// Field holding each member's identity
    fn identity_field(&self) -> &'static str {
        "name"
    }

    /// Engine used to match declared members with observed ones.
    ///
    /// Keyed by [`CrudHandler::identity_field`] unless overridden, e.g. with
    /// [`SetDiff::new`] for identities spanning several fields.
    fn diff_engine(&self) -> SetDiff {
        SetDiff::by_field(self.identity_field())
    }

    /// Keys of handlers that must run before this one
    fn depends_on(&self) -> &'static [&'static str] {
        &[]
    }

    /// Schema declaration for the collection
    fn get_schema(&self) -> FieldSpec;

    /// Bring a member into canonical form before diffing
    ///
    /// Both declared and observed members pass through here, so defaults
    /// filled in on one side do not show up as spurious changes.
    fn normalize(&self, record: &Record) -> Result<Record> {
        Ok(record.clone())
    }

    fn create(&self, ctx: &VersionContext<'_>, record: &Record) -> Result<()>;

    /// List the remote members of the collection
    fn read(&self, ctx: &VersionContext<'_>) -> Result<Vec<Record>>;

    /// Apply `changes` (the changed fields of `record`) to the member `identity`
    ///
    /// Only called for members with at least one changed field; no-op
    /// updates are never issued.
    fn update(
        &self,
        ctx: &VersionContext<'_>,
        identity: &str,
        changes: &Record,
        record: &Record,
    ) -> Result<()>;

    fn delete(&self, ctx: &VersionContext<'_>, identity: &str, record: &Record) -> Result<()>;
}

/// Lifts a [`CrudHandler`] onto the [`AttributeHandler`] protocol
pub struct CrudAdapter<H> {
    inner: H,
}

impl<H: CrudHandler> CrudAdapter<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    /// Diff of observed against declared members, both normalized
    pub fn diff(&self, state: &ResourceData) -> Result<DiffResult> {
        let (old, new) = state.get_records_change(self.inner.key())?;
        let old = self.normalize_all(&old)?;
        let new = self.normalize_all(&new)?;
        self.inner.diff_engine().diff(&old, &new)
    }

    fn normalize_all(&self, records: &[Record]) -> Result<Vec<Record>> {
        records.iter().map(|r| self.inner.normalize(r)).collect()
    }

    /// Attach handler, identity and version to a failed remote call
    fn mutation(&self, ctx: &VersionContext<'_>, identity: &str, result: Result<()>) -> Result<()> {
        result.map_err(|e| match e {
            Error::Transport(source) => Error::Mutation {
                handler: self.inner.key().to_string(),
                identity: identity.to_string(),
                version: ctx.version(),
                source,
            },
            other => other,
        })
    }
}

impl<H: CrudHandler> AttributeHandler for CrudAdapter<H> {
    fn key(&self) -> &'static str {
        self.inner.key()
    }

    fn depends_on(&self) -> &'static [&'static str] {
        self.inner.depends_on()
    }

    fn register(&self, schema: &mut Schema) {
        schema.register(self.inner.get_schema());
    }

    fn read(
        &self,
        ctx: &VersionContext<'_>,
        snapshot: &Version,
        state: &mut ResourceData,
    ) -> Result<()> {
        let records = self.inner.read(ctx)?;
        log::debug!(
            "Read {} {} record(s) from version {}",
            records.len(),
            self.inner.key(),
            snapshot.number
        );
        state.set(self.inner.key(), records_to_value(&records));
        Ok(())
    }

    /// Deletes, then creates, then updates, each in identity order.
    ///
    /// The first failure aborts the remaining calls; nothing already applied
    /// is rolled back.
    fn process(&self, ctx: &VersionContext<'_>, state: &mut ResourceData) -> Result<()> {
        let key = self.inner.key();
        let engine = self.inner.diff_engine();
        let diff = engine.sorted(self.diff(state)?)?;
        log::info!("{}: {} on {}", key, diff.summary(), ctx.target);

        for record in &diff.deleted {
            let identity = engine.identity(record)?;
            match self.inner.delete(ctx, &identity, record) {
                Err(e) if e.is_not_found() => {
                    log::debug!(
                        "{} `{}` already absent from version {}",
                        key,
                        identity,
                        ctx.version()
                    );
                }
                other => self.mutation(ctx, &identity, other)?,
            }
        }
        for record in &diff.added {
            let identity = engine.identity(record)?;
            self.mutation(ctx, &identity, self.inner.create(ctx, record))?;
        }
        for modified in diff.changed() {
            let result =
                self.inner
                    .update(ctx, &modified.identity, &modified.changes, &modified.record);
            self.mutation(ctx, &modified.identity, result)?;
        }
        Ok(())
    }

    /// A declared collection differs when its normalized diff has changes.
    ///
    /// Malformed state counts as a change so `process` reports it.
    fn has_change(&self, state: &ResourceData) -> bool {
        self.diff(state).map(|d| d.has_changes()).unwrap_or(true)
    }

    fn preview(&self, state: &ResourceData) -> Result<Option<DiffResult>> {
        self.diff(state).map(Some)
    }
}
