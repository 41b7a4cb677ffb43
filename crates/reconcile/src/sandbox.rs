//! In-process remote for tests and offline use
//!
//! [`SandboxTransport`] keeps services, versions and their sub-resources in
//! memory and enforces the rules the orchestrator depends on:
//! - Activating a version locks it; locked versions reject mutations
//! - Cloning copies settings and every collection into version max + 1
//! - A freshly cloned version stays invisible for a configurable number of
//!   reads (eventual consistency)
//! - Deployments progress through `in_progress` before completing
//! - Any call can be made to fail once via [`SandboxTransport::fail_next`]
//!
//! The whole state serializes to JSON so a file can act as a remote.

use crate::batch::{BatchOp, BatchOperation};
use crate::context::VersionRef;
use crate::error::TransportError;
use crate::record::{Record, composite_identity, identity_of};
use crate::transport::{Transport, TransportResult};
use crate::types::{
    NewService, Observation, Service, ServiceType, ServiceUpdate, Validation, Version,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

const DOMAINS: &str = "domains";
const CONDITIONS: &str = "conditions";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SandboxVersion {
    #[serde(flatten)]
    meta: Version,
    #[serde(default)]
    settings: Record,
    #[serde(default)]
    collections: BTreeMap<String, Vec<Record>>,
}

impl SandboxVersion {
    fn new(number: u32) -> Self {
        Self {
            meta: Version::draft(number),
            settings: Record::new(),
            collections: BTreeMap::new(),
        }
    }

    fn items(&self, collection: &str) -> &[Record] {
        self.collections.get(collection).map_or(&[], Vec::as_slice)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SandboxService {
    id: String,
    name: String,
    #[serde(default)]
    comment: String,
    #[serde(rename = "type", default)]
    service_type: ServiceType,
    versions: Vec<SandboxVersion>,
}

impl SandboxService {
    fn view(&self) -> Service {
        Service {
            id: self.id.clone(),
            name: self.name.clone(),
            comment: self.comment.clone(),
            service_type: self.service_type,
            versions: self.versions.iter().map(|v| v.meta.clone()).collect(),
        }
    }

    fn version_mut(&mut self, number: u32) -> TransportResult<&mut SandboxVersion> {
        let id = format!("{}@v{}", self.id, number);
        self.versions
            .iter_mut()
            .find(|v| v.meta.number == number)
            .ok_or_else(|| TransportError::not_found("version", id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Deployment {
    service_id: String,
    version: u32,
    component: String,
    remaining: u32,
    #[serde(default)]
    failure: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SandboxState {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    services: BTreeMap<String, SandboxService>,
    #[serde(default)]
    deployments: BTreeMap<String, Deployment>,
    #[serde(default)]
    identity_fields: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    visibility_lag: u32,
    #[serde(default)]
    deployment_steps: u32,
    #[serde(default)]
    deployment_failure: Option<String>,
    #[serde(default)]
    validation_failure: Option<String>,
    /// Remaining invisible reads per freshly cloned version
    #[serde(skip)]
    hidden: BTreeMap<VersionRef, u32>,
    #[serde(skip)]
    failures: BTreeMap<String, VecDeque<TransportError>>,
    #[serde(skip)]
    calls: Vec<String>,
}

impl SandboxState {
    /// Log a call and pop any failure injected for it
    fn enter(&mut self, op: &str, detail: String, collection: Option<&str>) -> TransportResult<()> {
        self.calls.push(format!("{op} {detail}"));
        let mut keys = vec![op.to_string()];
        if let Some(collection) = collection {
            keys.insert(0, format!("{op}:{collection}"));
        }
        for key in keys {
            if let Some(err) = self.failures.get_mut(&key).and_then(VecDeque::pop_front) {
                log::debug!("sandbox: injected failure for {key}: {err}");
                return Err(err);
            }
        }
        Ok(())
    }

    fn service_mut(&mut self, id: &str) -> TransportResult<&mut SandboxService> {
        self.services
            .get_mut(id)
            .ok_or_else(|| TransportError::not_found("service", id))
    }

    fn version_mut(&mut self, version: &VersionRef) -> TransportResult<&mut SandboxVersion> {
        self.service_mut(&version.service_id)?
            .version_mut(version.number)
    }

    /// A version that may still be changed
    fn draft_mut(&mut self, version: &VersionRef) -> TransportResult<&mut SandboxVersion> {
        let draft = self.version_mut(version)?;
        if !draft.meta.is_mutable() {
            return Err(TransportError::rejected(format!(
                "version {} is locked",
                version.number
            )));
        }
        Ok(draft)
    }

    fn identity_fields(&self, collection: &str) -> Vec<String> {
        self.identity_fields
            .get(collection)
            .cloned()
            .unwrap_or_else(|| vec!["name".to_string()])
    }
}

/// Apply a partial update; `null` values remove the field
fn merge(target: &mut Record, changes: &Record) {
    for (key, value) in changes {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}

fn identity(record: &Record, fields: &[String]) -> Option<String> {
    let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
    composite_identity(record, &fields).ok()
}

fn position(items: &[Record], fields: &[String], wanted: &str) -> Option<usize> {
    items
        .iter()
        .position(|r| identity(r, fields).is_some_and(|id| id == wanted))
}

fn insert_item(
    items: &mut Vec<Record>,
    collection: &str,
    fields: &[String],
    record: &Record,
) -> TransportResult<()> {
    let identity = identity(record, fields).ok_or_else(|| {
        TransportError::rejected(format!(
            "{collection} member has no `{}`",
            fields.join("`/`")
        ))
    })?;
    if position(items, fields, &identity).is_some() {
        return Err(TransportError::rejected(format!(
            "{collection} `{identity}` already exists"
        )));
    }
    items.push(record.clone());
    Ok(())
}

fn check_version(service_type: ServiceType, version: &SandboxVersion) -> Validation {
    if service_type == ServiceType::Vcl && version.items(DOMAINS).is_empty() {
        return Validation::invalid("at least one domain is required");
    }
    let conditions: Vec<String> = version
        .items(CONDITIONS)
        .iter()
        .filter_map(|r| identity_of(r, "name").ok())
        .collect();
    for (collection, items) in &version.collections {
        for item in items {
            for (field, value) in item {
                if field.ends_with("_condition")
                    && let Value::String(name) = value
                    && !conditions.contains(name)
                {
                    return Validation::invalid(format!(
                        "{collection}: condition `{name}` referenced by `{field}` does not exist"
                    ));
                }
            }
        }
    }
    Validation::ok()
}

/// In-memory [`Transport`] implementation
#[derive(Debug, Default)]
pub struct SandboxTransport {
    state: Mutex<SandboxState>,
}

impl SandboxTransport {
    /// Empty remote; ACL entries are keyed by ACL, address and subnet,
    /// everything else by `name`
    pub fn new() -> Self {
        let sandbox = Self::default();
        sandbox.set_identity_fields("acl_entries", &["acl", "ip", "subnet"]);
        sandbox
    }

    /// Restore a remote saved with [`SandboxTransport::to_json`]
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let state: SandboxState = serde_json::from_str(json)?;
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&*self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fields identifying members of `collection`, combined like
    /// [`composite_identity`]
    pub fn set_identity_fields(&self, collection: &str, fields: &[&str]) {
        self.lock().identity_fields.insert(
            collection.to_string(),
            fields.iter().map(|f| (*f).to_string()).collect(),
        );
    }

    /// Fail the next call of `op` once
    ///
    /// `op` is a method name (`activate_version`) or a method name and a
    /// collection (`create_item:backends`).
    pub fn fail_next(&self, op: &str, error: TransportError) {
        self.lock()
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(error);
    }

    /// Make every validation fail with `message` until cleared
    pub fn fail_validation(&self, message: Option<String>) {
        self.lock().validation_failure = message;
    }

    /// Make every deployment end in `failed` with `message` until cleared
    pub fn fail_deployments(&self, message: Option<String>) {
        self.lock().deployment_failure = message;
    }

    /// Number of `get_version` reads a cloned version stays invisible for
    pub fn set_visibility_lag(&self, reads: u32) {
        self.lock().visibility_lag = reads;
    }

    /// Number of `in_progress` readings before a deployment completes
    pub fn set_deployment_steps(&self, steps: u32) {
        self.lock().deployment_steps = steps;
    }

    /// Every call made so far, e.g. `clone_version svc-1@v3`
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

impl Transport for SandboxTransport {
    fn create_service(&self, input: &NewService) -> TransportResult<Service> {
        let mut state = self.lock();
        state.enter("create_service", input.name.clone(), None)?;
        if state.services.values().any(|s| s.name == input.name) {
            return Err(TransportError::rejected(format!(
                "a service named `{}` already exists",
                input.name
            )));
        }
        state.next_id += 1;
        let id = format!("svc-{}", state.next_id);
        let service = SandboxService {
            id: id.clone(),
            name: input.name.clone(),
            comment: input.comment.clone(),
            service_type: input.service_type,
            versions: vec![SandboxVersion::new(1)],
        };
        let view = service.view();
        state.services.insert(id, service);
        Ok(view)
    }

    fn get_service(&self, service_id: &str) -> TransportResult<Service> {
        let mut state = self.lock();
        state.enter("get_service", service_id.to_string(), None)?;
        Ok(state.service_mut(service_id)?.view())
    }

    fn update_service(&self, service_id: &str, update: &ServiceUpdate) -> TransportResult<Service> {
        let mut state = self.lock();
        state.enter("update_service", service_id.to_string(), None)?;
        let service = state.service_mut(service_id)?;
        if let Some(name) = &update.name {
            service.name.clone_from(name);
        }
        if let Some(comment) = &update.comment {
            service.comment.clone_from(comment);
        }
        Ok(service.view())
    }

    fn delete_service(&self, service_id: &str) -> TransportResult<()> {
        let mut state = self.lock();
        state.enter("delete_service", service_id.to_string(), None)?;
        let service = state.service_mut(service_id)?;
        if let Some(active) = service.versions.iter().find(|v| v.meta.active) {
            return Err(TransportError::rejected(format!(
                "version {} is active; deactivate it before deleting the service",
                active.meta.number
            )));
        }
        state.services.remove(service_id);
        Ok(())
    }

    fn get_version(&self, version: &VersionRef) -> TransportResult<Version> {
        let mut state = self.lock();
        state.enter("get_version", version.to_string(), None)?;
        if let Some(remaining) = state.hidden.get_mut(version)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(TransportError::not_found("version", version.to_string()));
        }
        Ok(state.version_mut(version)?.meta.clone())
    }

    fn clone_version(&self, version: &VersionRef) -> TransportResult<Version> {
        let mut state = self.lock();
        state.enter("clone_version", version.to_string(), None)?;
        let lag = state.visibility_lag;
        let service = state.service_mut(&version.service_id)?;
        let source = service.version_mut(version.number)?.clone();
        let number = service
            .versions
            .iter()
            .map(|v| v.meta.number)
            .max()
            .unwrap_or(0)
            + 1;
        let clone = SandboxVersion {
            meta: Version {
                number,
                active: false,
                locked: false,
                comment: source.meta.comment.clone(),
            },
            settings: source.settings,
            collections: source.collections,
        };
        let meta = clone.meta.clone();
        service.versions.push(clone);
        if lag > 0 {
            state
                .hidden
                .insert(VersionRef::new(version.service_id.clone(), number), lag);
        }
        Ok(meta)
    }

    fn validate_version(&self, version: &VersionRef) -> TransportResult<Validation> {
        let mut state = self.lock();
        state.enter("validate_version", version.to_string(), None)?;
        if let Some(message) = &state.validation_failure {
            return Ok(Validation::invalid(message.clone()));
        }
        let service = state.service_mut(&version.service_id)?;
        let service_type = service.service_type;
        let target = service.version_mut(version.number)?;
        Ok(check_version(service_type, target))
    }

    fn activate_version(&self, version: &VersionRef) -> TransportResult<Version> {
        let mut state = self.lock();
        state.enter("activate_version", version.to_string(), None)?;
        let service = state.service_mut(&version.service_id)?;
        service.version_mut(version.number)?;
        for v in &mut service.versions {
            v.meta.active = v.meta.number == version.number;
        }
        let target = service.version_mut(version.number)?;
        target.meta.locked = true;
        Ok(target.meta.clone())
    }

    fn deactivate_version(&self, version: &VersionRef) -> TransportResult<Version> {
        let mut state = self.lock();
        state.enter("deactivate_version", version.to_string(), None)?;
        let target = state.version_mut(version)?;
        target.meta.active = false;
        Ok(target.meta.clone())
    }

    fn update_version_comment(&self, version: &VersionRef, comment: &str) -> TransportResult<Version> {
        let mut state = self.lock();
        state.enter("update_version_comment", version.to_string(), None)?;
        let target = state.version_mut(version)?;
        target.meta.comment = Some(comment.to_string());
        Ok(target.meta.clone())
    }

    fn list_items(&self, version: &VersionRef, collection: &str) -> TransportResult<Vec<Record>> {
        let mut state = self.lock();
        state.enter("list_items", format!("{version} {collection}"), Some(collection))?;
        Ok(state.version_mut(version)?.items(collection).to_vec())
    }

    fn create_item(
        &self,
        version: &VersionRef,
        collection: &str,
        record: &Record,
    ) -> TransportResult<Record> {
        let mut state = self.lock();
        state.enter("create_item", format!("{version} {collection}"), Some(collection))?;
        let fields = state.identity_fields(collection);
        let draft = state.draft_mut(version)?;
        let items = draft.collections.entry(collection.to_string()).or_default();
        insert_item(items, collection, &fields, record)?;
        Ok(record.clone())
    }

    fn update_item(
        &self,
        version: &VersionRef,
        collection: &str,
        identity: &str,
        changes: &Record,
    ) -> TransportResult<Record> {
        let mut state = self.lock();
        state.enter("update_item", format!("{version} {collection}"), Some(collection))?;
        let fields = state.identity_fields(collection);
        let draft = state.draft_mut(version)?;
        let items = draft.collections.entry(collection.to_string()).or_default();
        let index = position(items, &fields, identity)
            .ok_or_else(|| TransportError::not_found(collection, identity))?;
        merge(&mut items[index], changes);
        Ok(items[index].clone())
    }

    fn delete_item(
        &self,
        version: &VersionRef,
        collection: &str,
        identity: &str,
    ) -> TransportResult<()> {
        let mut state = self.lock();
        state.enter("delete_item", format!("{version} {collection}"), Some(collection))?;
        let fields = state.identity_fields(collection);
        let draft = state.draft_mut(version)?;
        let items = draft.collections.entry(collection.to_string()).or_default();
        let index = position(items, &fields, identity)
            .ok_or_else(|| TransportError::not_found(collection, identity))?;
        items.remove(index);
        Ok(())
    }

    fn get_settings(&self, version: &VersionRef) -> TransportResult<Record> {
        let mut state = self.lock();
        state.enter("get_settings", version.to_string(), None)?;
        Ok(state.version_mut(version)?.settings.clone())
    }

    fn update_settings(&self, version: &VersionRef, settings: &Record) -> TransportResult<Record> {
        let mut state = self.lock();
        state.enter("update_settings", version.to_string(), None)?;
        let draft = state.draft_mut(version)?;
        merge(&mut draft.settings, settings);
        Ok(draft.settings.clone())
    }

    /// Chunks apply atomically: any failing operation leaves the
    /// collection untouched.
    fn batch_modify(
        &self,
        version: &VersionRef,
        collection: &str,
        chunk: &[BatchOperation],
    ) -> TransportResult<()> {
        let mut state = self.lock();
        state.enter(
            "batch_modify",
            format!("{version} {collection} ({} operations)", chunk.len()),
            Some(collection),
        )?;
        let fields = state.identity_fields(collection);
        let draft = state.draft_mut(version)?;
        let mut items = draft.items(collection).to_vec();
        for operation in chunk {
            match operation.op {
                BatchOp::Create => {
                    insert_item(&mut items, collection, &fields, &operation.payload)?;
                }
                BatchOp::Update => {
                    let index = position(&items, &fields, &operation.identity)
                        .ok_or_else(|| TransportError::not_found(collection, &operation.identity))?;
                    merge(&mut items[index], &operation.payload);
                }
                BatchOp::Delete => {
                    let index = position(&items, &fields, &operation.identity)
                        .ok_or_else(|| TransportError::not_found(collection, &operation.identity))?;
                    items.remove(index);
                }
            }
        }
        draft.collections.insert(collection.to_string(), items);
        Ok(())
    }

    fn start_deployment(&self, version: &VersionRef, component: &str) -> TransportResult<String> {
        let mut state = self.lock();
        state.enter("start_deployment", format!("{version} {component}"), None)?;
        state.version_mut(version)?;
        state.next_id += 1;
        let id = format!("deploy-{}", state.next_id);
        let deployment = Deployment {
            service_id: version.service_id.clone(),
            version: version.number,
            component: component.to_string(),
            remaining: state.deployment_steps,
            failure: state.deployment_failure.clone(),
        };
        state.deployments.insert(id.clone(), deployment);
        Ok(id)
    }

    fn deployment_status(&self, service_id: &str, deployment_id: &str) -> TransportResult<Observation> {
        let mut state = self.lock();
        state.enter("deployment_status", deployment_id.to_string(), None)?;
        let deployment = state
            .deployments
            .get_mut(deployment_id)
            .filter(|d| d.service_id == service_id)
            .ok_or_else(|| TransportError::not_found("deployment", deployment_id))?;
        if deployment.remaining > 0 {
            deployment.remaining -= 1;
            return Ok(Observation::new("in_progress"));
        }
        Ok(match &deployment.failure {
            Some(message) => Observation::with_message("failed", message.clone()),
            None => Observation::with_message(
                "completed",
                format!(
                    "{} deployed to version {}",
                    deployment.component, deployment.version
                ),
            ),
        })
    }
}
