//! # Reconcile
//!
//! Reconciliation of declared state against a versioned remote service.
//!
//! A service is a stack of numbered versions. Once a version is activated it
//! is locked; further changes go into a clone. This crate decides when a new
//! draft is needed, lets independent attribute handlers apply their part of
//! the declared state to it, then validates and activates the result.
//!
//! ## Core Concepts
//!
//! - **SetDiff**: identity-keyed diff of unordered collections
//! - **AttributeHandler**: one sub-resource category taking part in a version
//! - **CrudAdapter**: lifts plain create/read/update/delete handlers onto the protocol
//! - **Orchestrator**: the version lifecycle (clone, process, validate, activate)
//! - **ReadinessPoller**: bounded wait for asynchronous remote steps
//! - **Transport**: the remote API, with an in-process [`SandboxTransport`]
//!
//! ## Example
//!
//! ```ignore
//! use reconcile::{
//!     CrudAdapter, HandlerRegistry, Orchestrator, ResourceData, SandboxTransport,
//!     TypedCollection,
//! };
//!
//! let registry = HandlerRegistry::new(vec![
//!     Box::new(CrudAdapter::new(TypedCollection::<Domain>::new())),
//!     Box::new(CrudAdapter::new(TypedCollection::<Backend>::new())),
//! ])?;
//!
//! let remote = SandboxTransport::new();
//! let mut state = ResourceData::new(declared);
//! let outcome = Orchestrator::new(&remote, &registry).create(&mut state)?;
//! println!("built version {:?}", outcome.version);
//! ```

pub mod batch;
pub mod collection;
pub mod context;
pub mod diff;
pub mod error;
pub mod handler;
pub mod orchestrator;
pub mod poller;
pub mod record;
pub mod registry;
pub mod sandbox;
pub mod schema;
pub mod state;
pub mod transport;
pub mod types;

pub use batch::{BatchOp, BatchOperation, DEFAULT_MAX_BATCH_SIZE, dispatch};
pub use collection::{BatchCollection, Component, TypedCollection};
pub use context::{CancelToken, VersionContext, VersionRef};
pub use diff::{DiffResult, DiffSummary, Modified, SetDiff};
pub use error::{Error, ErrorCategory, Result, TransportError};
pub use handler::{AttributeHandler, BoxedHandler, CrudAdapter, CrudHandler};
pub use orchestrator::{
    CLONE_PENDING, CLONE_READY, DraftDecision, Orchestrator, Outcome, SettlePolicy, working_version,
};
pub use poller::ReadinessPoller;
pub use record::Record;
pub use registry::HandlerRegistry;
pub use sandbox::SandboxTransport;
pub use schema::{FieldKind, FieldSpec, Schema, keys};
pub use state::ResourceData;
pub use transport::{Transport, TransportResult};
pub use types::{
    NewService, Observation, Service, ServiceType, ServiceUpdate, Validation, Version,
    VersionPhase,
};
