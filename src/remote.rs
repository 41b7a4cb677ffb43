//! File-backed remote store
//!
//! The CLI talks to a [`SandboxTransport`] persisted as JSON, so plans and
//! applies can be exercised end to end without a network API.

use anyhow::{Context, Result};
use reconcile::{SandboxTransport, Transport};
use std::fs;
use std::path::{Path, PathBuf};

pub struct Remote {
    path: PathBuf,
    sandbox: SandboxTransport,
}

impl Remote {
    /// Open the store, starting empty when the file doesn't exist
    pub fn open(path: &Path) -> Result<Self> {
        let sandbox = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read remote store: {}", path.display()))?;
            SandboxTransport::from_json(&content)
                .with_context(|| format!("Failed to parse remote store: {}", path.display()))?
        } else {
            log::debug!("No remote store at {}, starting empty", path.display());
            SandboxTransport::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            sandbox,
        })
    }

    pub fn transport(&self) -> &dyn Transport {
        &self.sandbox
    }

    #[cfg(test)]
    pub fn sandbox(&self) -> &SandboxTransport {
        &self.sandbox
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = self
            .sandbox
            .to_json()
            .context("Failed to serialize remote store")?;
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write remote store: {}", self.path.display()))?;
        log::debug!("Saved remote store to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::{NewService, ServiceType};
    use tempfile::TempDir;

    #[test]
    fn test_remote_persists_services() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("remote.json");

        let remote = Remote::open(&path).unwrap();
        let service = remote
            .transport()
            .create_service(&NewService {
                name: "www".into(),
                comment: String::new(),
                service_type: ServiceType::Vcl,
            })
            .unwrap();
        remote.save().unwrap();

        let reopened = Remote::open(&path).unwrap();
        let loaded = reopened.transport().get_service(&service.id).unwrap();
        assert_eq!(loaded.name, "www");
        assert_eq!(loaded.versions.len(), 1);
    }

    #[test]
    fn test_corrupt_store_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("remote.json");
        fs::write(&path, "not json").unwrap();
        assert!(Remote::open(&path).is_err());
    }
}
