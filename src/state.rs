use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reconcile::ResourceData;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

// ============================================================================
// State Structures
// ============================================================================

/// What the last run observed for one service
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceState {
    /// Remote service id, once created
    #[serde(default)]
    pub id: Option<String>,

    /// Observed values keyed like the service file
    #[serde(default)]
    pub observed: Map<String, Value>,

    /// Last time the state was updated
    pub last_updated: DateTime<Utc>,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            id: None,
            observed: Map::new(),
            last_updated: Utc::now(),
        }
    }
}

impl ServiceState {
    /// Pair the recorded observations with freshly declared values
    pub fn into_resource(self, declared: Map<String, Value>) -> ResourceData {
        ResourceData::with_observed(self.id, declared, self.observed)
    }

    /// Capture the observed side of a finished run
    pub fn from_resource(data: &ResourceData) -> Self {
        Self {
            id: data.id().map(str::to_string),
            observed: data.observed().clone(),
            last_updated: Utc::now(),
        }
    }

    /// Whether the service exists remotely as far as we know
    pub fn is_created(&self) -> bool {
        self.id.is_some()
    }
}

// ============================================================================
// State Store
// ============================================================================

/// Directory of per-service state files
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Get the default state directory path (~/.local/state/cdnver)
    pub fn default_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".local").join("state").join("cdnver"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// State file for a state key.
    ///
    /// Bytes outside `[A-Za-z0-9._-]` are written as `%XX`, so distinct
    /// keys never share a file.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let mut file = String::with_capacity(key.len());
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
                file.push(char::from(byte));
            } else {
                file.push_str(&format!("%{byte:02X}"));
            }
        }
        self.dir.join(format!("{file}.json"))
    }

    /// Load state from disk, or return default if the file doesn't exist
    pub fn load(&self, key: &str) -> Result<ServiceState> {
        let path = self.path_for(key);

        if !path.exists() {
            log::debug!("No state for {key}, starting fresh");
            return Ok(ServiceState::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;

        let state: ServiceState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

        log::debug!("Loaded state from {}", path.display());
        Ok(state)
    }

    /// Save state to disk
    pub fn save(&self, key: &str, state: &ServiceState) -> Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| {
            format!("Failed to create state directory: {}", self.dir.display())
        })?;

        let path = self.path_for(key);
        let content =
            serde_json::to_string_pretty(state).context("Failed to serialize state to JSON")?;

        fs::write(&path, content)
            .with_context(|| format!("Failed to write state file: {}", path.display()))?;

        log::debug!("Saved state to {}", path.display());
        Ok(())
    }

    /// Forget a service; a missing file is not an error
    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove state file: {}", path.display()))?;
            log::debug!("Removed state file {}", path.display());
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_state_is_default() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let state = store.load("www").unwrap();
        assert!(!state.is_created());
        assert!(state.observed.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("nested"));

        let mut state = ServiceState {
            id: Some("svc-1".into()),
            ..ServiceState::default()
        };
        state.observed.insert("name".into(), json!("www"));
        state.observed.insert("active_version".into(), json!(3));
        store.save("www", &state).unwrap();

        let loaded = store.load("www").unwrap();
        assert_eq!(loaded.id.as_deref(), Some("svc-1"));
        assert_eq!(loaded.observed["active_version"], json!(3));
    }

    #[test]
    fn test_path_for_escapes_keys() {
        let store = StateStore::new("/tmp/state");
        assert_eq!(
            store.path_for("my site/prod"),
            PathBuf::from("/tmp/state/my%20site%2Fprod.json")
        );
        assert_eq!(
            store.path_for("www.example-1"),
            PathBuf::from("/tmp/state/www.example-1.json")
        );
    }

    #[test]
    fn test_path_for_keeps_similar_keys_apart() {
        let store = StateStore::new("/tmp/state");
        assert_ne!(store.path_for("a/b"), store.path_for("a_b"));
        assert_ne!(store.path_for("a/b"), store.path_for("a%2Fb"));

        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let state = ServiceState {
            id: Some("svc-1".into()),
            ..ServiceState::default()
        };
        store.save("a/b", &state).unwrap();
        assert!(!store.load("a_b").unwrap().is_created());
        assert!(store.load("a/b").unwrap().is_created());
    }

    #[test]
    fn test_resource_round_trip_keeps_observed_side() {
        let mut observed = Map::new();
        observed.insert("comment".into(), json!("old"));
        let state = ServiceState {
            id: Some("svc-2".into()),
            observed,
            ..ServiceState::default()
        };

        let mut declared = Map::new();
        declared.insert("comment".into(), json!("new"));
        let data = state.into_resource(declared);
        assert!(data.has_change("comment"));

        let back = ServiceState::from_resource(&data);
        assert_eq!(back.id.as_deref(), Some("svc-2"));
        assert_eq!(back.observed["comment"], json!("old"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        store.save("www", &ServiceState::default()).unwrap();
        store.remove("www").unwrap();
        store.remove("www").unwrap();
        assert!(!store.path_for("www").exists());
    }
}
