//! Sub-resource handlers per service type
//!
//! Registration order is execution order: a handler's dependencies are
//! always listed before it.

pub mod acl;
pub mod edge;
pub mod logging;
pub mod routing;
pub mod settings;
pub mod waf;

use crate::config::ToolConfig;
use reconcile::{
    BatchCollection, BoxedHandler, Component, CrudAdapter, HandlerRegistry, Result, ServiceType,
    TypedCollection,
};

use acl::{Acl, AclEntry};
use edge::{Header, Snippet};
use logging::Syslog;
use routing::{Backend, Condition, Domain, Healthcheck};
use settings::SettingsHandler;
use waf::WafHandler;

fn crud<C: Component + 'static>() -> BoxedHandler {
    Box::new(CrudAdapter::new(TypedCollection::<C>::new()))
}

/// Handlers for a service type, in execution order
pub fn registry(service_type: ServiceType, config: &ToolConfig) -> Result<HandlerRegistry> {
    let entries: BoxedHandler = Box::new(BatchCollection::<AclEntry>::new(config.batch_size));
    let handlers = match service_type {
        ServiceType::Vcl => vec![
            Box::new(SettingsHandler) as BoxedHandler,
            crud::<Condition>(),
            crud::<Domain>(),
            crud::<Healthcheck>(),
            crud::<Backend>(),
            crud::<Header>(),
            crud::<Snippet>(),
            crud::<Syslog>(),
            crud::<Acl>(),
            entries,
            Box::new(WafHandler::new(config.deployment_poller())),
        ],
        ServiceType::Compute => vec![
            crud::<Domain>(),
            crud::<Healthcheck>(),
            crud::<Backend>(),
            crud::<Acl>(),
            entries,
        ],
    };
    HandlerRegistry::new(handlers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vcl_registry_order() {
        let registry = registry(ServiceType::Vcl, &ToolConfig::default()).unwrap();
        let keys = registry.keys();
        assert_eq!(keys.first(), Some(&"settings"));
        let position = |key: &str| keys.iter().position(|k| *k == key).unwrap();
        assert!(position("condition") < position("header"));
        assert!(position("healthcheck") < position("backend"));
        assert!(position("acl") < position("acl_entry"));
        assert_eq!(keys.last(), Some(&"waf_rule"));
    }

    #[test]
    fn test_compute_registry_has_no_vcl_only_handlers() {
        let registry = registry(ServiceType::Compute, &ToolConfig::default()).unwrap();
        for key in ["settings", "condition", "header", "snippet", "logging_syslog", "waf_rule"] {
            assert!(registry.get(key).is_none(), "{key} should be VCL only");
        }
        assert!(registry.get("backend").is_some());
    }

    #[test]
    fn test_registry_schema_covers_every_handler() {
        let registry = registry(ServiceType::Vcl, &ToolConfig::default()).unwrap();
        let schema = registry.schema();
        for key in registry.keys() {
            assert!(schema.contains(key), "{key} missing from schema");
        }
        assert_eq!(
            schema.get("acl_entry").and_then(|f| f.identity),
            Some("ip")
        );
    }
}
