pub mod apply;
pub mod plan;
pub mod show;

use crate::Context;
use crate::components;
use crate::remote::Remote;
use crate::schema::ServiceFile;
use crate::state::ServiceState;
use anyhow::{Context as _, Result};
use reconcile::{HandlerRegistry, Orchestrator, ResourceData};
use serde_json::{Map, Value};
use std::path::Path;

/// Everything one command needs for a single service
pub struct Session {
    pub file: ServiceFile,
    /// Key of the recorded state
    pub key: String,
    pub registry: HandlerRegistry,
    pub data: ResourceData,
    pub remote: Remote,
}

impl Session {
    /// Load the service file, its recorded state and the remote store
    pub fn open(ctx: &Context, path: &Path) -> Result<Self> {
        Self::open_with(ctx, path, Map::new())
    }

    /// Like [`Session::open`], with declared values overridden from the
    /// command line
    pub fn open_with(ctx: &Context, path: &Path, overrides: Map<String, Value>) -> Result<Self> {
        let file = ServiceFile::load(path)?;
        let registry = components::registry(file.service.service_type, &ctx.config)
            .context("Failed to set up handlers")?;

        let mut declared = file.declared()?;
        declared.extend(overrides);

        let key = file.state_key(path)?;
        let state = ctx.store.load(&key)?;
        let data = state.into_resource(declared);
        let remote = Remote::open(&ctx.remote_path)?;

        Ok(Self {
            file,
            key,
            registry,
            data,
            remote,
        })
    }

    pub fn name(&self) -> &str {
        self.file.name()
    }

    /// Persist observed state and the remote store
    pub fn save(&self, ctx: &Context) -> Result<()> {
        ctx.store
            .save(&self.key, &ServiceState::from_resource(&self.data))?;
        self.remote.save()
    }
}

/// Orchestrator over a session's remote and handlers
pub fn orchestrator<'a>(
    ctx: &Context,
    remote: &'a Remote,
    registry: &'a HandlerRegistry,
) -> Orchestrator<'a> {
    Orchestrator::new(remote.transport(), registry)
        .with_settle(ctx.config.settle_policy())
        .with_cancel(ctx.cancel.clone())
}

/// Report a reconcile failure with its category advice
pub fn report_failure(err: &reconcile::Error) {
    let category = err.category();
    crate::ui::error(&format!("{}: {err}", category.description()));
    crate::ui::dim(category.advice());
}
