//! The remote API as seen by the orchestrator and handlers
//!
//! The transport is an opaque collaborator: each call is synchronous and
//! either returns the remote object or a [`TransportError`]. A delete of an
//! already-absent object must return [`TransportError::NotFound`] so callers
//! can treat it as done.

use crate::batch::BatchOperation;
use crate::context::VersionRef;
use crate::error::TransportError;
use crate::record::Record;
use crate::types::{NewService, Observation, Service, ServiceUpdate, Validation, Version};

/// Result of a remote call
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Remote API for services, versions and their sub-resources
pub trait Transport {
    /// Create a service with an empty, mutable version 1
    fn create_service(&self, input: &NewService) -> TransportResult<Service>;

    /// Fetch a service and its version list
    fn get_service(&self, service_id: &str) -> TransportResult<Service>;

    /// Change service-scoped fields (name, comment)
    fn update_service(&self, service_id: &str, update: &ServiceUpdate) -> TransportResult<Service>;

    fn delete_service(&self, service_id: &str) -> TransportResult<()>;

    /// Fetch one version
    fn get_version(&self, version: &VersionRef) -> TransportResult<Version>;

    /// Copy a version into a new mutable version numbered max + 1
    fn clone_version(&self, version: &VersionRef) -> TransportResult<Version>;

    /// Side-effect-free check of a version
    fn validate_version(&self, version: &VersionRef) -> TransportResult<Validation>;

    /// Make a version the active one; it becomes locked
    fn activate_version(&self, version: &VersionRef) -> TransportResult<Version>;

    fn deactivate_version(&self, version: &VersionRef) -> TransportResult<Version>;

    fn update_version_comment(&self, version: &VersionRef, comment: &str)
    -> TransportResult<Version>;

    /// List the members of a sub-resource collection
    fn list_items(&self, version: &VersionRef, collection: &str) -> TransportResult<Vec<Record>>;

    fn create_item(
        &self,
        version: &VersionRef,
        collection: &str,
        record: &Record,
    ) -> TransportResult<Record>;

    /// Apply a partial update to the member identified by `identity`
    fn update_item(
        &self,
        version: &VersionRef,
        collection: &str,
        identity: &str,
        changes: &Record,
    ) -> TransportResult<Record>;

    fn delete_item(
        &self,
        version: &VersionRef,
        collection: &str,
        identity: &str,
    ) -> TransportResult<()>;

    /// Version-wide settings
    fn get_settings(&self, version: &VersionRef) -> TransportResult<Record>;

    fn update_settings(&self, version: &VersionRef, settings: &Record) -> TransportResult<Record>;

    /// Apply one chunk of bulk operations to a collection
    fn batch_modify(
        &self,
        version: &VersionRef,
        collection: &str,
        chunk: &[BatchOperation],
    ) -> TransportResult<()>;

    /// Start asynchronous provisioning of a component; returns a deployment id
    fn start_deployment(&self, version: &VersionRef, component: &str) -> TransportResult<String>;

    /// Current status of a deployment started with [`Transport::start_deployment`]
    fn deployment_status(&self, service_id: &str, deployment_id: &str)
    -> TransportResult<Observation>;
}
