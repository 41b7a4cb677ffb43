//! Dependency-ordered handler registry
//!
//! Handlers run in registration order. A handler's dependencies must be
//! registered before it, so the order is checked once at construction and
//! never re-sorted at run time.

use crate::error::{Error, Result};
use crate::handler::{AttributeHandler, BoxedHandler};
use crate::schema::Schema;
use std::collections::HashSet;

/// Ordered set of attribute handlers for one service type
pub struct HandlerRegistry {
    handlers: Vec<BoxedHandler>,
}

impl HandlerRegistry {
    /// Build a registry, checking keys are unique and dependencies come first
    pub fn new(handlers: Vec<BoxedHandler>) -> Result<Self> {
        let mut seen: HashSet<&'static str> = HashSet::new();
        for handler in &handlers {
            for dependency in handler.depends_on() {
                if !seen.contains(dependency) {
                    return Err(Error::HandlerOrder {
                        handler: handler.key().to_string(),
                        dependency: (*dependency).to_string(),
                    });
                }
            }
            if !seen.insert(handler.key()) {
                return Err(Error::Schema(format!(
                    "handler `{}` is registered twice",
                    handler.key()
                )));
            }
        }
        Ok(Self { handlers })
    }

    /// Handlers in execution order
    pub fn iter(&self) -> impl Iterator<Item = &dyn AttributeHandler> {
        self.handlers.iter().map(|h| &**h)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Handler keys in execution order
    pub fn keys(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.key()).collect()
    }

    pub fn get(&self, key: &str) -> Option<&dyn AttributeHandler> {
        self.iter().find(|h| h.key() == key)
    }

    /// Schema of service-level keys plus every handler's key
    pub fn schema(&self) -> Schema {
        let mut schema = Schema::with_service_fields();
        for handler in &self.handlers {
            handler.register(&mut schema);
        }
        schema
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::VersionContext;
    use crate::schema::FieldSpec;
    use crate::state::ResourceData;
    use crate::types::Version;

    struct Stub {
        key: &'static str,
        depends_on: &'static [&'static str],
    }

    impl AttributeHandler for Stub {
        fn key(&self) -> &'static str {
            self.key
        }

        fn depends_on(&self) -> &'static [&'static str] {
            self.depends_on
        }

        fn register(&self, schema: &mut Schema) {
            schema.register(FieldSpec::collection(self.key, "stub", "name", &[]));
        }

        fn read(&self, _: &VersionContext<'_>, _: &Version, _: &mut ResourceData) -> Result<()> {
            Ok(())
        }

        fn process(&self, _: &VersionContext<'_>, _: &mut ResourceData) -> Result<()> {
            Ok(())
        }
    }

    fn stub(key: &'static str, depends_on: &'static [&'static str]) -> BoxedHandler {
        Box::new(Stub { key, depends_on })
    }

    #[test]
    fn test_registry_preserves_order() {
        let registry = HandlerRegistry::new(vec![
            stub("condition", &[]),
            stub("backend", &["condition"]),
            stub("header", &["condition"]),
        ])
        .unwrap();
        assert_eq!(registry.keys(), vec!["condition", "backend", "header"]);
        assert_eq!(registry.len(), 3);
        assert!(registry.get("backend").is_some());
    }

    #[test]
    fn test_dependency_after_dependent_is_rejected() {
        let err = HandlerRegistry::new(vec![stub("backend", &["condition"]), stub("condition", &[])])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::HandlerOrder { ref handler, ref dependency }
                if handler == "backend" && dependency == "condition"
        ));
    }

    #[test]
    fn test_duplicate_keys_are_rejected() {
        assert!(HandlerRegistry::new(vec![stub("domain", &[]), stub("domain", &[])]).is_err());
    }

    #[test]
    fn test_schema_includes_service_and_handler_keys() {
        let registry = HandlerRegistry::new(vec![stub("domain", &[])]).unwrap();
        let schema = registry.schema();
        assert!(schema.contains("domain"));
        assert!(schema.contains("name"));
        assert!(schema.contains("active_version"));
    }
}
