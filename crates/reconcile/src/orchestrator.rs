//! Version lifecycle orchestration
//!
//! The orchestrator turns a declared/observed [`ResourceData`] into remote
//! calls:
//!
//! 1. Service-scoped fields (name, comment) are updated in place
//! 2. Handlers that must run are collected; with none, nothing is cloned
//! 3. A mutable draft is resolved, cloning the locked version if needed
//! 4. Handlers process the draft in registry order
//! 5. The draft is validated, then activated unless `activate = false`
//!
//! The observed `active_version` only moves after validation and activation
//! both succeed.

use crate::context::{CancelToken, VersionContext, VersionRef};
use crate::error::{Error, Result};
use crate::handler::AttributeHandler;
use crate::poller::ReadinessPoller;
use crate::registry::HandlerRegistry;
use crate::schema::keys;
use crate::state::ResourceData;
use crate::transport::Transport;
use crate::types::{
    NewService, Observation, Service, ServiceType, ServiceUpdate, Version, VersionPhase,
};
use serde_json::{Value, json};
use std::thread;
use std::time::Duration;

/// Status reported to the poller while a cloned version is not usable yet
pub const CLONE_PENDING: &str = "pending";
/// Status reported to the poller once a cloned version is readable and mutable
pub const CLONE_READY: &str = "ready";

/// How to wait for a freshly cloned version to become usable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlePolicy {
    /// Use the clone immediately
    None,
    /// Sleep for a fixed duration
    Delay(Duration),
    /// Poll the version until it reads back as mutable.
    ///
    /// The poller sees `pending` while the version is missing or locked and
    /// `ready` once it is mutable.
    Poll(ReadinessPoller),
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self::Poll(ReadinessPoller::new([CLONE_PENDING], [CLONE_READY]))
    }
}

/// Where the next version-scoped change is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftDecision {
    /// A mutable version is written as is
    Reuse(u32),
    /// The locked version is cloned first
    Clone { from: u32 },
}

/// The version observed state is read from and the next update builds on.
///
/// A mutable version newer than the active one (left by `activate = false`
/// or a failed activation) wins over the active version; without an active
/// version the latest one is used.
pub fn working_version(service: &Service) -> Option<&Version> {
    let active = service.active_version();
    let floor = active.map_or(0, |v| v.number);
    service
        .latest_version()
        .filter(|v| v.is_mutable() && v.number > floor)
        .or(active)
        .or_else(|| service.latest_version())
}

/// What a run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Version that was built, if any
    pub version: Option<u32>,
    /// Whether a new version was cloned
    pub cloned: bool,
    /// Whether the built version passed validation
    pub validated: bool,
    /// Whether the built version was activated
    pub activated: bool,
    /// Whether the run stopped early on cancellation
    pub cancelled: bool,
    /// Whether service-scoped fields were updated
    pub service_updated: bool,
    /// Handler keys processed, in order
    pub processed: Vec<&'static str>,
}

impl Outcome {
    /// Whether the run changed anything remotely
    pub fn changed(&self) -> bool {
        self.service_updated || self.version.is_some()
    }
}

/// Drives one service through the version lifecycle
pub struct Orchestrator<'a> {
    transport: &'a dyn Transport,
    registry: &'a HandlerRegistry,
    settle: SettlePolicy,
    cancel: CancelToken,
    phase: VersionPhase,
}

impl<'a> Orchestrator<'a> {
    pub fn new(transport: &'a dyn Transport, registry: &'a HandlerRegistry) -> Self {
        Self {
            transport,
            registry,
            settle: SettlePolicy::default(),
            cancel: CancelToken::new(),
            phase: VersionPhase::default(),
        }
    }

    pub fn with_settle(mut self, settle: SettlePolicy) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Phase reached by the last run
    pub fn phase(&self) -> VersionPhase {
        self.phase
    }

    /// Where `update` would write version-scoped changes for `state`.
    ///
    /// Builds on the recorded `cloned_version`, falling back to
    /// [`working_version`].
    pub fn plan_draft(service: &Service, state: &ResourceData) -> Result<DraftDecision> {
        let base = state
            .get_version(keys::CLONED_VERSION)?
            .and_then(|n| service.version(n))
            .or_else(|| working_version(service))
            .ok_or_else(|| Error::State {
                key: keys::CLONED_VERSION.to_string(),
                reason: format!("service {} has no versions", service.id),
            })?;
        Ok(if base.is_mutable() {
            DraftDecision::Reuse(base.number)
        } else {
            DraftDecision::Clone { from: base.number }
        })
    }

    /// A mutable version newer than the active one, left behind by an
    /// interrupted or `activate = false` run.
    ///
    /// An activating `update` with nothing to build activates it.
    pub fn pending_activation(service: &Service, state: &ResourceData) -> Result<Option<u32>> {
        let Some(number) = state.get_version(keys::CLONED_VERSION)? else {
            return Ok(None);
        };
        let active = service.active_version().map_or(0, |v| v.number);
        Ok(service
            .version(number)
            .filter(|v| v.is_mutable() && v.number > active)
            .map(|v| v.number))
    }

    fn transition(&mut self, next: VersionPhase) {
        if self.phase != next {
            log::debug!("Version phase: {} -> {}", self.phase, next);
            self.phase = next;
        }
    }

    /// Create the service, then build and activate version 1
    pub fn create(&mut self, state: &mut ResourceData) -> Result<Outcome> {
        self.registry.schema().validate(state.declared())?;

        let name = state
            .get_str(keys::NAME)?
            .ok_or_else(|| Error::Schema("`name` is required".to_string()))?
            .to_string();
        let service_type = match state.get_str(keys::TYPE)? {
            Some(value) => value.parse::<ServiceType>().map_err(Error::Schema)?,
            None => ServiceType::default(),
        };
        let comment = declared_str(state, keys::COMMENT).to_string();

        self.transition(VersionPhase::NoDraft);
        let service = self.transport.create_service(&NewService {
            name,
            comment,
            service_type,
        })?;
        log::info!("Created {} service {} ({})", service_type, service.name, service.id);

        state.set_id(Some(service.id.clone()));
        state.commit(keys::NAME);
        state.commit(keys::COMMENT);
        state.set(keys::TYPE, json!(service_type.as_str()));
        let first = service.latest_version().map_or(1, |v| v.number);
        state.set(keys::CLONED_VERSION, json!(first));

        self.apply(state, true)
    }

    /// Bring the remote service in line with the declared state
    pub fn update(&mut self, state: &mut ResourceData) -> Result<Outcome> {
        self.registry.schema().validate(state.declared())?;
        self.apply(state, false)
    }

    fn apply(&mut self, state: &mut ResourceData, is_initial_version: bool) -> Result<Outcome> {
        let service_id = service_id(state)?;
        check_type_unchanged(state)?;

        let mut outcome = Outcome {
            service_updated: self.update_service(&service_id, state, is_initial_version)?,
            ..Outcome::default()
        };

        let registry = self.registry;
        let pending: Vec<&dyn AttributeHandler> = registry
            .iter()
            .filter(|h| h.must_process(state, is_initial_version))
            .collect();
        let comment_changed = state.has_change(keys::VERSION_COMMENT);
        let activate = state.get_bool(keys::ACTIVATE, true)?;

        let service = self.transport.get_service(&service_id)?;

        if pending.is_empty() && !comment_changed {
            if activate && let Some(draft) = Self::pending_activation(&service, state)? {
                log::info!("Version {draft} was built earlier but never activated");
                let target = VersionRef::new(service_id, draft);
                outcome.version = Some(draft);
                self.finish(&target, &service, state, activate, &mut outcome)?;
            } else {
                log::info!("No version-scoped changes; nothing to build");
            }
            return Ok(outcome);
        }

        let target = self.resolve_draft(&service, state, &mut outcome)?;
        outcome.version = Some(target.number);

        if comment_changed {
            let comment = declared_str(state, keys::VERSION_COMMENT);
            self.transport.update_version_comment(&target, comment)?;
            state.commit(keys::VERSION_COMMENT);
        }

        self.transition(VersionPhase::Processing);
        let ctx = VersionContext::new(&target, self.transport);
        for handler in pending {
            if self.cancel.is_cancelled() {
                log::warn!(
                    "Cancelled before {}; version {} keeps the changes applied so far",
                    handler.key(),
                    target.number
                );
                outcome.cancelled = true;
                return Ok(outcome);
            }
            log::debug!("Processing {} on {}", handler.key(), target);
            handler.process(&ctx, state)?;
            state.commit(handler.key());
            outcome.processed.push(handler.key());
        }

        self.finish(&target, &service, state, activate, &mut outcome)?;
        Ok(outcome)
    }

    /// Service-scoped changes never need a new version
    fn update_service(
        &self,
        service_id: &str,
        state: &mut ResourceData,
        is_initial_version: bool,
    ) -> Result<bool> {
        if is_initial_version {
            return Ok(false);
        }
        let mut update = ServiceUpdate::default();
        if state.has_change(keys::NAME) {
            update.name = state.get_str(keys::NAME)?.map(str::to_string);
        }
        if state.has_change(keys::COMMENT) {
            update.comment = Some(declared_str(state, keys::COMMENT).to_string());
        }
        if update.is_empty() {
            return Ok(false);
        }
        self.transport.update_service(service_id, &update)?;
        log::info!("Updated service {service_id}");
        state.commit(keys::NAME);
        state.commit(keys::COMMENT);
        Ok(true)
    }

    /// Reuse the mutable draft, or clone the locked version into a new one
    fn resolve_draft(
        &mut self,
        service: &Service,
        state: &mut ResourceData,
        outcome: &mut Outcome,
    ) -> Result<VersionRef> {
        let from = match Self::plan_draft(service, state)? {
            DraftDecision::Reuse(number) => {
                if self.phase != VersionPhase::NoDraft {
                    self.transition(VersionPhase::Mutable);
                }
                log::debug!("Reusing mutable version {number}");
                return Ok(VersionRef::new(service.id.clone(), number));
            }
            DraftDecision::Clone { from } => from,
        };

        self.transition(VersionPhase::Cloning);
        let source = VersionRef::new(service.id.clone(), from);
        let cloned = self.transport.clone_version(&source)?;
        log::info!("Cloned version {from} into {}", cloned.number);
        state.set(keys::CLONED_VERSION, json!(cloned.number));
        outcome.cloned = true;

        let target = VersionRef::new(service.id.clone(), cloned.number);
        self.settle(&target)?;
        self.transition(VersionPhase::Mutable);
        Ok(target)
    }

    fn settle(&self, target: &VersionRef) -> Result<()> {
        match &self.settle {
            SettlePolicy::None => Ok(()),
            SettlePolicy::Delay(delay) => {
                log::debug!("Waiting {delay:?} for version {} to settle", target.number);
                thread::sleep(*delay);
                Ok(())
            }
            SettlePolicy::Poll(poller) => poller
                .wait_for("cloned version", target.number, || {
                    match self.transport.get_version(target) {
                        Ok(version) if version.is_mutable() => Ok(Observation::new(CLONE_READY)),
                        Ok(_) => Ok(Observation::new(CLONE_PENDING)),
                        Err(e) if e.is_not_found() => Ok(Observation::new(CLONE_PENDING)),
                        Err(e) => Err(e.into()),
                    }
                })
                .map(|_| ()),
        }
    }

    /// Validate the draft, then activate it when asked to
    fn finish(
        &mut self,
        target: &VersionRef,
        service: &Service,
        state: &mut ResourceData,
        activate: bool,
        outcome: &mut Outcome,
    ) -> Result<()> {
        self.transition(VersionPhase::Validating);
        let validation = self.transport.validate_version(target)?;
        if !validation.valid {
            self.transition(VersionPhase::Invalid);
            return Err(Error::Validation {
                version: target.number,
                message: validation.message,
            });
        }
        self.transition(VersionPhase::Validated);
        outcome.validated = true;

        let active = service.active_version().map(|v| v.number);
        if !activate {
            log::info!("Version {} is valid; leaving it inactive", target.number);
            return Ok(());
        }
        if active == Some(target.number) {
            return Ok(());
        }

        self.transition(VersionPhase::Activating);
        self.transport
            .activate_version(target)
            .map_err(|source| Error::Activation {
                version: target.number,
                source,
            })?;
        self.transition(VersionPhase::Active);
        state.set(keys::ACTIVE_VERSION, json!(target.number));
        outcome.activated = true;
        log::info!("Activated version {}", target.number);
        Ok(())
    }

    /// Refresh observed state from the remote service.
    ///
    /// Returns `false`, and forgets the service id, when the service no
    /// longer exists.
    pub fn read(&mut self, state: &mut ResourceData) -> Result<bool> {
        let Some(id) = state.id().map(str::to_string) else {
            return Ok(false);
        };
        let service = match self.transport.get_service(&id) {
            Ok(service) => service,
            Err(e) if e.is_not_found() => {
                log::warn!("Service {id} no longer exists remotely");
                state.set_id(None);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        state.set(keys::NAME, json!(service.name));
        // An empty remote comment reads back as unset
        let comment = if service.comment.is_empty() {
            Value::Null
        } else {
            json!(service.comment)
        };
        state.set(keys::COMMENT, comment);
        state.set(keys::TYPE, json!(service.service_type.as_str()));
        state.set(
            keys::ACTIVE_VERSION,
            service
                .active_version()
                .map_or(Value::Null, |v| json!(v.number)),
        );

        // The next update builds on the version read here
        let snapshot = working_version(&service).ok_or_else(|| Error::State {
            key: keys::ACTIVE_VERSION.to_string(),
            reason: format!("service {id} has no versions"),
        })?;
        state.set(keys::CLONED_VERSION, json!(snapshot.number));
        state.set(
            keys::VERSION_COMMENT,
            snapshot.comment.clone().map_or(Value::Null, Value::String),
        );

        let target = VersionRef::new(id, snapshot.number);
        let ctx = VersionContext::new(&target, self.transport);
        for handler in self.registry.iter() {
            handler.read(&ctx, snapshot, state)?;
        }
        self.phase = if snapshot.active {
            VersionPhase::Active
        } else {
            VersionPhase::Mutable
        };
        Ok(true)
    }

    /// Deactivate and delete the service.
    ///
    /// With `force_destroy` or `reuse` the active version is deactivated
    /// first; with `reuse` the service itself is kept.
    pub fn delete(&mut self, state: &mut ResourceData) -> Result<()> {
        let Some(id) = state.id().map(str::to_string) else {
            return Ok(());
        };
        let force = state.get_bool(keys::FORCE_DESTROY, false)?;
        let reuse = state.get_bool(keys::REUSE, false)?;

        if force || reuse {
            match self.transport.get_service(&id) {
                Ok(service) => {
                    if let Some(active) = service.active_version() {
                        let target = VersionRef::new(id.clone(), active.number);
                        self.transport.deactivate_version(&target)?;
                        log::info!("Deactivated version {}", active.number);
                    }
                }
                Err(e) if e.is_not_found() => {
                    state.set_id(None);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
            state.unset(keys::ACTIVE_VERSION);
        }

        if reuse {
            log::info!("Keeping service {id} for reuse");
        } else {
            match self.transport.delete_service(&id) {
                Ok(()) => log::info!("Deleted service {id}"),
                Err(e) if e.is_not_found() => log::debug!("Service {id} was already deleted"),
                Err(e) => return Err(e.into()),
            }
        }
        state.set_id(None);
        Ok(())
    }
}

fn service_id(state: &ResourceData) -> Result<String> {
    state.id().map(str::to_string).ok_or_else(|| Error::State {
        key: "id".to_string(),
        reason: "the service has not been created yet".to_string(),
    })
}

/// Declared string value, empty when unset
fn declared_str<'s>(state: &'s ResourceData, key: &str) -> &'s str {
    state
        .declared()
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn check_type_unchanged(state: &ResourceData) -> Result<()> {
    let (observed, declared) = state.get_change(keys::TYPE);
    match (observed.and_then(Value::as_str), declared.and_then(Value::as_str)) {
        (Some(current), Some(wanted)) if current != wanted => Err(Error::Schema(format!(
            "service type cannot change from {current} to {wanted}; create a new service instead"
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{Component, TypedCollection};
    use crate::error::TransportError;
    use crate::handler::CrudAdapter;
    use crate::sandbox::SandboxTransport;
    use serde::{Deserialize, Serialize};
    use serde_json::Map;

    #[derive(Serialize, Deserialize)]
    struct Domain {
        name: String,
        #[serde(default)]
        comment: Option<String>,
    }

    impl Component for Domain {
        const KEY: &'static str = "domain";
        const COLLECTION: &'static str = "domains";
        const DESCRIPTION: &'static str = "Domains";
        const FIELDS: &'static [&'static str] = &["name", "comment"];
    }

    #[derive(Serialize, Deserialize)]
    struct Condition {
        name: String,
        statement: String,
    }

    impl Component for Condition {
        const KEY: &'static str = "condition";
        const COLLECTION: &'static str = "conditions";
        const DESCRIPTION: &'static str = "Conditions";
        const FIELDS: &'static [&'static str] = &["name", "statement"];
    }

    #[derive(Serialize, Deserialize)]
    struct Backend {
        name: String,
        address: String,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        request_condition: Option<String>,
    }

    impl Component for Backend {
        const KEY: &'static str = "backend";
        const COLLECTION: &'static str = "backends";
        const DESCRIPTION: &'static str = "Backends";
        const FIELDS: &'static [&'static str] = &["name", "address", "port", "request_condition"];
        const DEPENDS_ON: &'static [&'static str] = &["condition"];
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new(vec![
            Box::new(CrudAdapter::new(TypedCollection::<Domain>::new())),
            Box::new(CrudAdapter::new(TypedCollection::<Condition>::new())),
            Box::new(CrudAdapter::new(TypedCollection::<Backend>::new())),
        ])
        .unwrap()
    }

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn base() -> Value {
        json!({
            "name": "example",
            "domain": [{"name": "example.com"}],
            "backend": [{"name": "origin", "address": "origin.example.com", "port": 443}],
        })
    }

    /// Next run's state: new declaration, previous observations
    fn redeclare(state: &ResourceData, declared: Value) -> ResourceData {
        ResourceData::with_observed(
            state.id().map(str::to_string),
            map(declared),
            state.observed().clone(),
        )
    }

    fn with_backend(name: &str) -> Value {
        let mut declared = base();
        declared["backend"]
            .as_array_mut()
            .unwrap()
            .push(json!({"name": name, "address": "b.example.com"}));
        declared
    }

    fn clones(sandbox: &SandboxTransport) -> usize {
        sandbox
            .calls()
            .iter()
            .filter(|c| c.starts_with("clone_version"))
            .count()
    }

    fn created(sandbox: &SandboxTransport, registry: &HandlerRegistry) -> ResourceData {
        let mut state = ResourceData::new(map(base()));
        let outcome = Orchestrator::new(sandbox, registry)
            .create(&mut state)
            .unwrap();
        assert!(outcome.activated);
        state
    }

    #[test]
    fn test_create_builds_and_activates_version_one() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let mut state = ResourceData::new(map(base()));
        let mut orchestrator = Orchestrator::new(&sandbox, &registry);
        let outcome = orchestrator.create(&mut state).unwrap();

        assert_eq!(outcome.version, Some(1));
        assert!(!outcome.cloned);
        assert_eq!(outcome.processed, vec!["domain", "backend"]);
        assert_eq!(state.get_version(keys::ACTIVE_VERSION).unwrap(), Some(1));
        assert_eq!(orchestrator.phase(), VersionPhase::Active);
        assert_eq!(clones(&sandbox), 0);
        assert!(!registry.get("backend").unwrap().has_change(&state));
    }

    #[test]
    fn test_locked_draft_with_change_clones_greater_version() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let state = created(&sandbox, &registry);

        let mut next = redeclare(&state, with_backend("second"));
        let outcome = Orchestrator::new(&sandbox, &registry)
            .update(&mut next)
            .unwrap();

        assert!(outcome.cloned);
        assert_eq!(outcome.version, Some(2));
        assert_eq!(outcome.processed, vec!["backend"]);
        assert_eq!(next.get_version(keys::ACTIVE_VERSION).unwrap(), Some(2));
        assert_eq!(next.get_version(keys::CLONED_VERSION).unwrap(), Some(2));
    }

    #[test]
    fn test_no_change_means_no_clone() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let state = created(&sandbox, &registry);
        sandbox.clear_calls();

        let mut next = redeclare(&state, base());
        let outcome = Orchestrator::new(&sandbox, &registry)
            .update(&mut next)
            .unwrap();

        assert_eq!(outcome, Outcome::default());
        assert!(!outcome.changed());
        assert_eq!(clones(&sandbox), 0);
    }

    #[test]
    fn test_active_three_clones_to_four_once() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let mut state = created(&sandbox, &registry);
        for name in ["b2", "b3"] {
            state = redeclare(&state, with_backend(name));
            Orchestrator::new(&sandbox, &registry)
                .update(&mut state)
                .unwrap();
        }
        assert_eq!(state.get_version(keys::ACTIVE_VERSION).unwrap(), Some(3));

        state = redeclare(&state, with_backend("b4"));
        let outcome = Orchestrator::new(&sandbox, &registry)
            .update(&mut state)
            .unwrap();
        assert_eq!(outcome.version, Some(4));
        assert!(outcome.cloned && outcome.activated);

        sandbox.clear_calls();
        state = redeclare(&state, with_backend("b4"));
        let outcome = Orchestrator::new(&sandbox, &registry)
            .update(&mut state)
            .unwrap();
        assert_eq!(outcome.version, None);
        assert_eq!(clones(&sandbox), 0);
        assert_eq!(state.get_version(keys::ACTIVE_VERSION).unwrap(), Some(4));
    }

    #[test]
    fn test_validation_failure_keeps_active_version() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let state = created(&sandbox, &registry);
        sandbox.fail_validation(Some("backend unreachable".into()));

        let mut next = redeclare(&state, with_backend("second"));
        let mut orchestrator = Orchestrator::new(&sandbox, &registry);
        let err = orchestrator.update(&mut next).unwrap_err();

        assert!(matches!(
            err,
            Error::Validation { version: 2, ref message } if message == "backend unreachable"
        ));
        assert_eq!(orchestrator.phase(), VersionPhase::Invalid);
        assert_eq!(next.get_version(keys::ACTIVE_VERSION).unwrap(), Some(1));
        let service = sandbox.get_service(next.id().unwrap()).unwrap();
        assert_eq!(service.active_version().map(|v| v.number), Some(1));
    }

    #[test]
    fn test_activation_failure_then_retry_activates_same_draft() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let state = created(&sandbox, &registry);
        sandbox.fail_next("activate_version", TransportError::rejected("quota exceeded"));

        let mut next = redeclare(&state, with_backend("second"));
        let err = Orchestrator::new(&sandbox, &registry)
            .update(&mut next)
            .unwrap_err();
        assert!(matches!(err, Error::Activation { version: 2, .. }));
        assert_eq!(next.get_version(keys::ACTIVE_VERSION).unwrap(), Some(1));

        sandbox.clear_calls();
        let mut retry = redeclare(&next, with_backend("second"));
        let outcome = Orchestrator::new(&sandbox, &registry)
            .update(&mut retry)
            .unwrap();
        assert!(outcome.activated);
        assert!(outcome.processed.is_empty());
        assert_eq!(outcome.version, Some(2));
        assert_eq!(clones(&sandbox), 0);
        assert_eq!(retry.get_version(keys::ACTIVE_VERSION).unwrap(), Some(2));
    }

    #[test]
    fn test_handler_failure_leaves_draft_and_active_version() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let state = created(&sandbox, &registry);
        sandbox.fail_next("create_item:backends", TransportError::rejected("bad address"));

        let mut next = redeclare(&state, with_backend("second"));
        let err = Orchestrator::new(&sandbox, &registry)
            .update(&mut next)
            .unwrap_err();
        assert!(matches!(err, Error::Mutation { version: 2, .. }));
        assert_eq!(next.get_version(keys::ACTIVE_VERSION).unwrap(), Some(1));
        assert_eq!(next.get_version(keys::CLONED_VERSION).unwrap(), Some(2));
    }

    #[test]
    fn test_cancellation_is_a_clean_stop() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let state = created(&sandbox, &registry);

        let cancel = CancelToken::new();
        cancel.cancel();
        let mut next = redeclare(&state, with_backend("second"));
        let outcome = Orchestrator::new(&sandbox, &registry)
            .with_cancel(cancel)
            .update(&mut next)
            .unwrap();

        assert!(outcome.cancelled);
        assert!(!outcome.activated);
        assert!(outcome.processed.is_empty());
        assert_eq!(next.get_version(keys::ACTIVE_VERSION).unwrap(), Some(1));
    }

    /// Domain handler that trips the cancel token once it has run
    struct CancelAfterDomains {
        inner: CrudAdapter<TypedCollection<Domain>>,
        cancel: CancelToken,
    }

    impl AttributeHandler for CancelAfterDomains {
        fn key(&self) -> &'static str {
            self.inner.key()
        }

        fn register(&self, schema: &mut crate::schema::Schema) {
            self.inner.register(schema);
        }

        fn read(
            &self,
            ctx: &VersionContext<'_>,
            snapshot: &Version,
            state: &mut ResourceData,
        ) -> Result<()> {
            self.inner.read(ctx, snapshot, state)
        }

        fn process(&self, ctx: &VersionContext<'_>, state: &mut ResourceData) -> Result<()> {
            self.inner.process(ctx, state)?;
            self.cancel.cancel();
            Ok(())
        }

        fn has_change(&self, state: &ResourceData) -> bool {
            self.inner.has_change(state)
        }
    }

    #[test]
    fn test_cancellation_between_handlers_keeps_applied_changes() {
        let sandbox = SandboxTransport::new();
        let state = created(&sandbox, &registry());

        let cancel = CancelToken::new();
        let cancelling = HandlerRegistry::new(vec![
            Box::new(CancelAfterDomains {
                inner: CrudAdapter::new(TypedCollection::<Domain>::new()),
                cancel: cancel.clone(),
            }),
            Box::new(CrudAdapter::new(TypedCollection::<Condition>::new())),
            Box::new(CrudAdapter::new(TypedCollection::<Backend>::new())),
        ])
        .unwrap();

        let mut declared = with_backend("second");
        declared["domain"]
            .as_array_mut()
            .unwrap()
            .push(json!({"name": "api.example.com"}));
        let mut next = redeclare(&state, declared.clone());
        let outcome = Orchestrator::new(&sandbox, &cancelling)
            .with_cancel(cancel)
            .update(&mut next)
            .unwrap();

        assert!(outcome.cancelled);
        assert!(!outcome.activated);
        assert_eq!(outcome.version, Some(2));
        assert_eq!(outcome.processed, vec!["domain"]);
        assert!(!next.has_change("domain"));
        assert!(next.has_change("backend"));

        let draft = VersionRef::new(next.id().unwrap(), 2);
        assert_eq!(sandbox.list_items(&draft, "domains").unwrap().len(), 2);
        assert_eq!(sandbox.list_items(&draft, "backends").unwrap().len(), 1);
        assert_eq!(next.get_version(keys::ACTIVE_VERSION).unwrap(), Some(1));

        sandbox.clear_calls();
        let mut resumed = redeclare(&next, declared);
        let outcome = Orchestrator::new(&sandbox, &registry())
            .update(&mut resumed)
            .unwrap();
        assert_eq!(outcome.processed, vec!["backend"]);
        assert_eq!(outcome.version, Some(2));
        assert!(outcome.activated);
        assert_eq!(clones(&sandbox), 0);
    }

    #[test]
    fn test_refreshed_update_after_inactive_draft_activates_it() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let state = created(&sandbox, &registry);

        let mut declared = with_backend("second");
        declared["activate"] = json!(false);
        let mut next = redeclare(&state, declared);
        let outcome = Orchestrator::new(&sandbox, &registry)
            .update(&mut next)
            .unwrap();
        assert_eq!(outcome.version, Some(2));
        assert!(!outcome.activated);

        let service = sandbox.get_service(next.id().unwrap()).unwrap();
        assert_eq!(working_version(&service).map(|v| v.number), Some(2));

        let mut refreshed = redeclare(&next, with_backend("second"));
        assert!(Orchestrator::new(&sandbox, &registry)
            .read(&mut refreshed)
            .unwrap());
        assert_eq!(refreshed.get_version(keys::CLONED_VERSION).unwrap(), Some(2));
        assert_eq!(refreshed.get_version(keys::ACTIVE_VERSION).unwrap(), Some(1));
        assert!(!registry.get("backend").unwrap().has_change(&refreshed));
        assert_eq!(
            Orchestrator::plan_draft(&service, &refreshed).unwrap(),
            DraftDecision::Reuse(2)
        );

        sandbox.clear_calls();
        let outcome = Orchestrator::new(&sandbox, &registry)
            .update(&mut refreshed)
            .unwrap();
        assert!(outcome.activated);
        assert_eq!(outcome.version, Some(2));
        assert!(outcome.processed.is_empty());
        assert_eq!(clones(&sandbox), 0);
        assert_eq!(refreshed.get_version(keys::ACTIVE_VERSION).unwrap(), Some(2));
    }

    #[test]
    fn test_refreshed_update_extends_inactive_draft() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let state = created(&sandbox, &registry);

        let mut declared = with_backend("second");
        declared["activate"] = json!(false);
        let mut next = redeclare(&state, declared);
        Orchestrator::new(&sandbox, &registry)
            .update(&mut next)
            .unwrap();

        let mut declared = with_backend("second");
        declared["backend"]
            .as_array_mut()
            .unwrap()
            .push(json!({"name": "third", "address": "c.example.com"}));
        let mut refreshed = redeclare(&next, declared);
        Orchestrator::new(&sandbox, &registry)
            .read(&mut refreshed)
            .unwrap();
        sandbox.clear_calls();
        let outcome = Orchestrator::new(&sandbox, &registry)
            .update(&mut refreshed)
            .unwrap();

        assert!(!outcome.cloned);
        assert_eq!(outcome.version, Some(2));
        assert_eq!(outcome.processed, vec!["backend"]);
        assert!(outcome.activated);
        let creates: Vec<_> = sandbox
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("create_item"))
            .collect();
        assert_eq!(creates.len(), 1);
    }

    #[test]
    fn test_service_fields_update_without_cloning() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let state = created(&sandbox, &registry);
        sandbox.clear_calls();

        let mut declared = base();
        declared["name"] = json!("renamed");
        declared["comment"] = json!("now with a comment");
        let mut next = redeclare(&state, declared);
        let outcome = Orchestrator::new(&sandbox, &registry)
            .update(&mut next)
            .unwrap();

        assert!(outcome.service_updated);
        assert_eq!(outcome.version, None);
        assert_eq!(clones(&sandbox), 0);
        let service = sandbox.get_service(next.id().unwrap()).unwrap();
        assert_eq!(service.name, "renamed");
        assert_eq!(service.comment, "now with a comment");
    }

    #[test]
    fn test_activate_false_leaves_validated_draft() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let state = created(&sandbox, &registry);

        let mut declared = with_backend("second");
        declared["activate"] = json!(false);
        let mut next = redeclare(&state, declared);
        let mut orchestrator = Orchestrator::new(&sandbox, &registry);
        let outcome = orchestrator.update(&mut next).unwrap();

        assert!(outcome.validated);
        assert!(!outcome.activated);
        assert_eq!(orchestrator.phase(), VersionPhase::Validated);
        assert_eq!(next.get_version(keys::ACTIVE_VERSION).unwrap(), Some(1));
    }

    #[test]
    fn test_version_comment_is_applied_to_draft() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let state = created(&sandbox, &registry);

        let mut declared = base();
        declared["version_comment"] = json!("rotate certificates");
        let mut next = redeclare(&state, declared);
        let outcome = Orchestrator::new(&sandbox, &registry)
            .update(&mut next)
            .unwrap();

        assert_eq!(outcome.version, Some(2));
        let version = sandbox
            .get_version(&VersionRef::new(next.id().unwrap(), 2))
            .unwrap();
        assert_eq!(version.comment.as_deref(), Some("rotate certificates"));
    }

    #[test]
    fn test_settle_poll_waits_for_visibility() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let state = created(&sandbox, &registry);
        sandbox.set_visibility_lag(2);

        let poller = ReadinessPoller::new([CLONE_PENDING], [CLONE_READY])
            .with_timeout(Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(1))
            .with_min_interval(Duration::from_millis(1));
        let mut next = redeclare(&state, with_backend("second"));
        let outcome = Orchestrator::new(&sandbox, &registry)
            .with_settle(SettlePolicy::Poll(poller))
            .update(&mut next)
            .unwrap();
        assert!(outcome.activated);
        let reads = sandbox
            .calls()
            .iter()
            .filter(|c| c.starts_with("get_version"))
            .count();
        assert_eq!(reads, 3);
    }

    #[test]
    fn test_type_change_is_rejected() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let state = created(&sandbox, &registry);

        let mut declared = base();
        declared["type"] = json!("compute");
        let mut next = redeclare(&state, declared);
        let err = Orchestrator::new(&sandbox, &registry)
            .update(&mut next)
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_unknown_declared_key_fails_before_remote_calls() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let mut declared = base();
        declared["backends"] = json!([]);
        let mut state = ResourceData::new(map(declared));
        let err = Orchestrator::new(&sandbox, &registry)
            .create(&mut state)
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
        assert!(sandbox.calls().is_empty());
    }

    #[test]
    fn test_read_refreshes_observed_state() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let state = created(&sandbox, &registry);

        let mut fresh = ResourceData::with_observed(
            state.id().map(str::to_string),
            map(base()),
            Map::new(),
        );
        let mut orchestrator = Orchestrator::new(&sandbox, &registry);
        assert!(orchestrator.read(&mut fresh).unwrap());
        assert_eq!(fresh.get_version(keys::ACTIVE_VERSION).unwrap(), Some(1));
        assert_eq!(fresh.get_observed(keys::NAME), Some(&json!("example")));
        assert_eq!(fresh.get_observed(keys::COMMENT), Some(&Value::Null));
        assert!(!fresh.has_change(keys::COMMENT));
        for handler in registry.iter() {
            assert!(!handler.has_change(&fresh), "{} differs", handler.key());
        }
    }

    #[test]
    fn test_read_of_deleted_service_forgets_id() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let mut state = ResourceData::with_observed(Some("svc-404".into()), Map::new(), Map::new());
        assert!(!Orchestrator::new(&sandbox, &registry).read(&mut state).unwrap());
        assert!(state.id().is_none());
    }

    #[test]
    fn test_delete_requires_force_for_active_service() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let state = created(&sandbox, &registry);
        let id = state.id().unwrap().to_string();

        let mut plain = redeclare(&state, base());
        assert!(Orchestrator::new(&sandbox, &registry).delete(&mut plain).is_err());

        let mut declared = base();
        declared["force_destroy"] = json!(true);
        let mut forced = redeclare(&state, declared);
        Orchestrator::new(&sandbox, &registry)
            .delete(&mut forced)
            .unwrap();
        assert!(forced.id().is_none());
        assert!(sandbox.get_service(&id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_with_reuse_keeps_service_inactive() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let state = created(&sandbox, &registry);
        let id = state.id().unwrap().to_string();

        let mut declared = base();
        declared["reuse"] = json!(true);
        let mut next = redeclare(&state, declared);
        Orchestrator::new(&sandbox, &registry)
            .delete(&mut next)
            .unwrap();

        assert!(next.id().is_none());
        let service = sandbox.get_service(&id).unwrap();
        assert!(service.active_version().is_none());
    }

    #[test]
    fn test_delete_of_missing_service_succeeds() {
        let sandbox = SandboxTransport::new();
        let registry = registry();
        let mut state = ResourceData::with_observed(Some("svc-404".into()), Map::new(), Map::new());
        Orchestrator::new(&sandbox, &registry)
            .delete(&mut state)
            .unwrap();
        assert!(state.id().is_none());
    }
}
