//! Web application firewall rules
//!
//! Rules are written per item like any other collection, but they only take
//! effect once the firewall is redeployed for the version. Deployment is
//! asynchronous, so processing ends by polling it to completion.

use reconcile::{
    AttributeHandler, Component, CrudAdapter, DiffResult, ReadinessPoller, ResourceData, Result,
    Schema, TypedCollection, Version, VersionContext,
};
use serde::{Deserialize, Serialize};

/// Component name passed to the deployment endpoint
const DEPLOYMENT_COMPONENT: &str = "firewall";

const ACTIONS: &[&str] = &["block", "log", "allow"];

/// Override of one managed firewall rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafRule {
    /// Rule identifier
    pub name: String,
    pub action: String,
    #[serde(default)]
    pub paranoia_level: Option<u8>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl Component for WafRule {
    const KEY: &'static str = "waf_rule";
    const COLLECTION: &'static str = "waf_rules";
    const DESCRIPTION: &'static str = "Firewall rule overrides, deployed on change";
    const FIELDS: &'static [&'static str] = &["name", "action", "paranoia_level", "comment"];

    fn check(&self) -> std::result::Result<(), String> {
        if !ACTIONS.contains(&self.action.as_str()) {
            return Err(format!(
                "unknown action `{}` (expected one of: {})",
                self.action,
                ACTIONS.join(", ")
            ));
        }
        if let Some(level) = self.paranoia_level
            && !(1..=4).contains(&level)
        {
            return Err(format!("paranoia_level {level} is outside 1-4"));
        }
        Ok(())
    }
}

/// Rule collection followed by a polled firewall deployment
pub struct WafHandler {
    rules: CrudAdapter<TypedCollection<WafRule>>,
    poller: ReadinessPoller,
}

impl WafHandler {
    pub fn new(poller: ReadinessPoller) -> Self {
        Self {
            rules: CrudAdapter::new(TypedCollection::new()),
            poller,
        }
    }

    fn deploy(&self, ctx: &VersionContext<'_>) -> Result<()> {
        let deployment = ctx
            .transport
            .start_deployment(ctx.target, DEPLOYMENT_COMPONENT)?;
        log::info!("Deploying firewall for {} ({deployment})", ctx.target);
        let observation = self
            .poller
            .wait_for(DEPLOYMENT_COMPONENT, ctx.version(), || {
                Ok(ctx
                    .transport
                    .deployment_status(&ctx.target.service_id, &deployment)?)
            })?;
        if let Some(message) = observation.message {
            log::info!("Firewall deployed: {message}");
        }
        Ok(())
    }
}

impl AttributeHandler for WafHandler {
    fn key(&self) -> &'static str {
        self.rules.key()
    }

    fn register(&self, schema: &mut Schema) {
        self.rules.register(schema);
    }

    fn read(
        &self,
        ctx: &VersionContext<'_>,
        snapshot: &Version,
        state: &mut ResourceData,
    ) -> Result<()> {
        self.rules.read(ctx, snapshot, state)
    }

    fn process(&self, ctx: &VersionContext<'_>, state: &mut ResourceData) -> Result<()> {
        self.rules.process(ctx, state)?;
        self.deploy(ctx)
    }

    fn has_change(&self, state: &ResourceData) -> bool {
        self.rules.has_change(state)
    }

    fn preview(&self, state: &ResourceData) -> Result<Option<DiffResult>> {
        self.rules.preview(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::{
        Error, NewService, SandboxTransport, ServiceType, Transport, TransportError, VersionRef,
    };
    use serde_json::{Map, json};
    use std::time::Duration;

    fn poller() -> ReadinessPoller {
        ReadinessPoller::new(["pending", "in_progress"], ["completed"])
            .with_timeout(Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(1))
            .with_min_interval(Duration::from_millis(1))
    }

    fn setup() -> (SandboxTransport, VersionRef) {
        let sandbox = SandboxTransport::new();
        let service = sandbox
            .create_service(&NewService {
                name: "www".into(),
                comment: String::new(),
                service_type: ServiceType::Vcl,
            })
            .unwrap();
        (sandbox, VersionRef::new(service.id, 1))
    }

    fn declared(rules: serde_json::Value) -> ResourceData {
        let mut map = Map::new();
        map.insert("waf_rule".into(), rules);
        ResourceData::new(map)
    }

    #[test]
    fn test_process_writes_rules_then_deploys() {
        let (sandbox, target) = setup();
        sandbox.set_deployment_steps(2);
        let ctx = VersionContext::new(&target, &sandbox);
        let mut state = declared(json!([{"name": "941100", "action": "block"}]));

        WafHandler::new(poller()).process(&ctx, &mut state).unwrap();

        let calls = sandbox.calls();
        let create = calls.iter().position(|c| c.starts_with("create_item")).unwrap();
        let deploy = calls.iter().position(|c| c.starts_with("start_deployment")).unwrap();
        assert!(create < deploy);
        let polls = calls.iter().filter(|c| c.starts_with("deployment_status")).count();
        assert_eq!(polls, 3);
        assert_eq!(sandbox.list_items(&target, "waf_rules").unwrap().len(), 1);
    }

    #[test]
    fn test_failed_deployment_is_reported() {
        let (sandbox, target) = setup();
        sandbox.fail_deployments(Some("rule 941100 conflicts".into()));
        let ctx = VersionContext::new(&target, &sandbox);
        let mut state = declared(json!([{"name": "941100", "action": "log"}]));

        let err = WafHandler::new(poller()).process(&ctx, &mut state).unwrap_err();
        assert!(matches!(
            err,
            Error::DeploymentFailed { ref status, ref message, .. }
                if status == "failed" && message == "rule 941100 conflicts"
        ));
    }

    #[test]
    fn test_rule_failure_skips_deployment() {
        let (sandbox, target) = setup();
        sandbox.fail_next("create_item:waf_rules", TransportError::rejected("quota"));
        let ctx = VersionContext::new(&target, &sandbox);
        let mut state = declared(json!([{"name": "941100", "action": "block"}]));

        let err = WafHandler::new(poller()).process(&ctx, &mut state).unwrap_err();
        assert!(matches!(err, Error::Mutation { .. }));
        assert!(!sandbox.calls().iter().any(|c| c.starts_with("start_deployment")));
    }

    #[test]
    fn test_unknown_action_is_a_change_that_fails() {
        let state = declared(json!([{"name": "941100", "action": "shrug"}]));
        let handler = WafHandler::new(poller());
        assert!(handler.has_change(&state));
        assert!(handler.preview(&state).is_err());
    }
}
