//! Version-level cache settings
//!
//! Settings are a single block rather than a collection. The remote always
//! has values for every field, so declared and observed blocks are compared
//! through their effective values with defaults filled in.

use reconcile::{
    AttributeHandler, Error, FieldSpec, Record, ResourceData, Result, Schema, Version,
    VersionContext,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const KEY: &str = "settings";

const DEFAULT_TTL: u32 = 3600;
const DEFAULT_STALE_IF_ERROR_TTL: u32 = 43200;

const FIELDS: &[&str] = &[
    "default_ttl",
    "default_host",
    "stale_if_error",
    "stale_if_error_ttl",
];

/// Declared settings; `None` means "leave at the remote default"
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub default_ttl: Option<u32>,
    #[serde(default)]
    pub default_host: Option<String>,
    #[serde(default)]
    pub stale_if_error: Option<bool>,
    #[serde(default)]
    pub stale_if_error_ttl: Option<u32>,
}

impl Settings {
    fn parse(value: Option<&Value>) -> Result<Self> {
        match value {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| Error::Record {
                kind: KEY.to_string(),
                identity: KEY.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Every field, with defaults for the unset ones
    fn effective(&self) -> Record {
        let mut record = Record::new();
        record.insert(
            "default_ttl".into(),
            json!(self.default_ttl.unwrap_or(DEFAULT_TTL)),
        );
        record.insert("default_host".into(), json!(self.default_host));
        record.insert(
            "stale_if_error".into(),
            json!(self.stale_if_error.unwrap_or(false)),
        );
        record.insert(
            "stale_if_error_ttl".into(),
            json!(self.stale_if_error_ttl.unwrap_or(DEFAULT_STALE_IF_ERROR_TTL)),
        );
        record
    }

    /// Only the explicitly declared fields
    fn explicit(&self) -> Record {
        let mut record = Record::new();
        if let Some(ttl) = self.default_ttl {
            record.insert("default_ttl".into(), json!(ttl));
        }
        if let Some(host) = &self.default_host {
            record.insert("default_host".into(), json!(host));
        }
        if let Some(stale) = self.stale_if_error {
            record.insert("stale_if_error".into(), json!(stale));
        }
        if let Some(ttl) = self.stale_if_error_ttl {
            record.insert("stale_if_error_ttl".into(), json!(ttl));
        }
        record
    }

    fn is_declared(&self) -> bool {
        !self.explicit().is_empty()
    }
}

/// Handler for the `[settings]` block
#[derive(Debug, Default)]
pub struct SettingsHandler;

impl SettingsHandler {
    /// `(observed, declared)` settings
    fn change(state: &ResourceData) -> Result<(Settings, Settings)> {
        let (old, new) = state.get_change(KEY);
        Ok((Settings::parse(old)?, Settings::parse(new)?))
    }

    /// Effective fields whose value differs
    fn changed_fields(state: &ResourceData) -> Result<Record> {
        let (old, new) = Self::change(state)?;
        let old = old.effective();
        Ok(new
            .effective()
            .into_iter()
            .filter(|(field, value)| old.get(field) != Some(value))
            .collect())
    }
}

impl AttributeHandler for SettingsHandler {
    fn key(&self) -> &'static str {
        KEY
    }

    fn register(&self, schema: &mut Schema) {
        schema.register(FieldSpec::block(KEY, "Version-level cache settings", FIELDS));
    }

    fn read(
        &self,
        ctx: &VersionContext<'_>,
        snapshot: &Version,
        state: &mut ResourceData,
    ) -> Result<()> {
        let remote = ctx.transport.get_settings(ctx.target)?;
        let settings = Settings::parse(Some(&Value::Object(remote)))?;
        log::debug!("Read settings from version {}", snapshot.number);
        state.set(KEY, Value::Object(settings.explicit()));
        Ok(())
    }

    fn process(&self, ctx: &VersionContext<'_>, state: &mut ResourceData) -> Result<()> {
        let mut changes = Self::changed_fields(state)?;
        if changes.is_empty() {
            // Declared values equal to the defaults still get written once
            changes = Self::change(state)?.1.explicit();
        }
        if changes.is_empty() {
            return Ok(());
        }
        log::info!("settings: updating {} field(s) on {}", changes.len(), ctx.target);
        ctx.transport
            .update_settings(ctx.target, &changes)
            .map_err(|source| Error::Mutation {
                handler: KEY.to_string(),
                identity: KEY.to_string(),
                version: ctx.version(),
                source,
            })?;
        Ok(())
    }

    fn has_change(&self, state: &ResourceData) -> bool {
        Self::changed_fields(state).map_or(true, |changes| !changes.is_empty())
    }

    fn must_process(&self, state: &ResourceData, is_initial_version: bool) -> bool {
        if is_initial_version
            && Self::change(state).is_ok_and(|(_, declared)| declared.is_declared())
        {
            return true;
        }
        self.has_change(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::{NewService, SandboxTransport, ServiceType, Transport, VersionRef};
    use serde_json::Map;

    fn state(declared: Option<Value>, observed: Option<Value>) -> ResourceData {
        let mut d = Map::new();
        let mut o = Map::new();
        if let Some(value) = declared {
            d.insert(KEY.into(), value);
        }
        if let Some(value) = observed {
            o.insert(KEY.into(), value);
        }
        ResourceData::with_observed(Some("svc-1".into()), d, o)
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

    #[test]
    fn test_default_valued_declaration_is_not_a_change() {
        let handler = SettingsHandler;
        let state = state(Some(json!({"default_ttl": 3600})), None);
        assert!(!handler.has_change(&state));
        assert!(!handler.must_process(&state, false));
    }

    #[test]
    fn test_explicit_declaration_is_processed_on_initial_version() {
        let handler = SettingsHandler;
        let state = state(Some(json!({"default_ttl": 3600})), None);
        assert!(handler.must_process(&state, true));
        assert!(!handler.must_process(&self::state(None, None), true));
    }

    #[test]
    fn test_changed_value_is_detected() {
        let handler = SettingsHandler;
        let state = state(
            Some(json!({"default_ttl": 60})),
            Some(json!({"default_ttl": 3600})),
        );
        assert!(handler.has_change(&state));
    }

    #[test]
    fn test_removed_block_reverts_to_defaults() {
        let handler = SettingsHandler;
        let state = state(None, Some(json!({"stale_if_error": true})));
        assert!(handler.has_change(&state));
        assert_eq!(
            SettingsHandler::changed_fields(&state).unwrap(),
            json!({"stale_if_error": false}).as_object().cloned().unwrap()
        );
    }

    #[test]
    fn test_process_sends_only_changed_fields() {
        let (sandbox, target) = setup();
        let ctx = VersionContext::new(&target, &sandbox);
        let mut state = state(
            Some(json!({"default_ttl": 60, "default_host": "www.example.com"})),
            Some(json!({"default_host": "www.example.com"})),
        );

        SettingsHandler.process(&ctx, &mut state).unwrap();

        let remote = sandbox.get_settings(&target).unwrap();
        assert_eq!(remote.get("default_ttl"), Some(&json!(60)));
        assert!(!remote.contains_key("default_host"));
    }

    #[test]
    fn test_process_writes_default_values_on_first_version() {
        let (sandbox, target) = setup();
        let ctx = VersionContext::new(&target, &sandbox);
        let mut state = state(Some(json!({"default_ttl": 3600})), None);

        SettingsHandler.process(&ctx, &mut state).unwrap();

        let remote = sandbox.get_settings(&target).unwrap();
        assert_eq!(remote.get("default_ttl"), Some(&json!(3600)));
    }

    #[test]
    fn test_read_keeps_known_fields() {
        let (sandbox, target) = setup();
        let update = json!({"default_ttl": 30, "general_vcl": "x"});
        sandbox
            .update_settings(&target, update.as_object().unwrap())
            .unwrap();
        let ctx = VersionContext::new(&target, &sandbox);
        let mut state = state(None, None);

        SettingsHandler
            .read(&ctx, &Version::draft(1), &mut state)
            .unwrap();

        assert_eq!(state.get_observed(KEY), Some(&json!({"default_ttl": 30})));
    }

    #[test]
    fn test_malformed_settings_are_a_record_error() {
        let state = state(Some(json!({"default_ttl": "soon"})), None);
        assert!(SettingsHandler.has_change(&state));
        assert!(matches!(
            SettingsHandler::changed_fields(&state),
            Err(Error::Record { .. })
        ));
    }
}
