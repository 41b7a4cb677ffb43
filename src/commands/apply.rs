//! Commands that change remote or recorded state: apply, refresh, destroy

use super::{Session, orchestrator, report_failure};
use crate::Context;
use crate::cli::{ApplyArgs, DestroyArgs, ServiceArgs};
use crate::ui;
use anyhow::{Context as _, Result};
use colored::Colorize;
use reconcile::{Outcome, keys};
use serde_json::{Map, Value};

pub fn apply(ctx: &Context, args: &ApplyArgs) -> Result<()> {
    let mut overrides = Map::new();
    if args.no_activate {
        overrides.insert(keys::ACTIVATE.to_string(), Value::Bool(false));
    }
    let mut session = Session::open_with(ctx, &args.service.file, overrides)?;

    if !ctx.quiet {
        ui::header(&format!("Applying {}", session.name()));
    }

    let Session {
        registry,
        data,
        remote,
        ..
    } = &mut session;
    let mut orchestrator = orchestrator(ctx, remote, registry);

    if !args.no_refresh && data.id().is_some() && !orchestrator.read(data)? {
        ui::warn("Service no longer exists remotely; it will be created again");
    }

    let result = if data.id().is_none() {
        orchestrator.create(data)
    } else {
        orchestrator.update(data)
    };
    let phase = orchestrator.phase();

    // Whatever was committed so far is real; record it even on failure
    session.save(ctx)?;

    match result {
        Ok(outcome) => {
            report(&outcome, ctx.quiet);
            Ok(())
        }
        Err(err) => {
            report_failure(&err);
            if err.category().leaves_draft() {
                ui::dim(&format!("Stopped in phase `{phase}`"));
            }
            Err(err).context("apply failed")
        }
    }
}

fn report(outcome: &Outcome, quiet: bool) {
    if outcome.cancelled {
        let version = outcome.version.map_or_else(String::new, |v| format!(" on version {v}"));
        ui::warn(&format!(
            "Cancelled{version} after {} handler(s); run apply again to finish",
            outcome.processed.len()
        ));
        return;
    }
    if !outcome.changed() {
        ui::success("No changes needed");
        return;
    }
    if quiet {
        return;
    }
    if outcome.service_updated {
        ui::info("Updated service name/comment");
    }
    if let Some(version) = outcome.version {
        if outcome.cloned {
            ui::info(&format!("Cloned into version {version}"));
        }
        if !outcome.processed.is_empty() {
            ui::kv("processed", &outcome.processed.join(", "));
        }
        if outcome.activated {
            ui::success(&format!("Version {} is active", version.to_string().bold()));
        } else if outcome.validated {
            ui::success(&format!("Version {version} is valid and left inactive"));
        }
    }
}

pub fn refresh(ctx: &Context, args: &ServiceArgs) -> Result<()> {
    let mut session = Session::open(ctx, &args.file)?;
    if session.data.id().is_none() {
        ui::info(&format!("{} has not been created yet", session.name()));
        return Ok(());
    }

    let Session {
        registry,
        data,
        remote,
        ..
    } = &mut session;
    let exists = orchestrator(ctx, remote, registry)
        .read(data)
        .inspect_err(report_failure)
        .context("refresh failed")?;
    session.save(ctx)?;

    if exists {
        ui::success(&format!("Refreshed {}", session.name()));
    } else {
        ui::warn(&format!(
            "{} no longer exists remotely; apply will create it",
            session.name()
        ));
    }
    Ok(())
}

pub fn destroy(ctx: &Context, args: &DestroyArgs) -> Result<()> {
    let mut overrides = Map::new();
    if args.force {
        overrides.insert(keys::FORCE_DESTROY.to_string(), Value::Bool(true));
    }
    if args.reuse {
        overrides.insert(keys::REUSE.to_string(), Value::Bool(true));
    }
    let mut session = Session::open_with(ctx, &args.service.file, overrides)?;
    let name = session.name().to_string();

    if session.data.id().is_none() {
        ui::info(&format!("{name} has not been created; nothing to destroy"));
        return Ok(());
    }

    if !args.yes {
        let prompt = if args.reuse {
            format!("Deactivate {name} and keep it for reuse?")
        } else {
            format!("Delete service {name}?")
        };
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            ui::info("Aborted");
            return Ok(());
        }
    }

    let Session {
        registry,
        data,
        remote,
        ..
    } = &mut session;
    let result = orchestrator(ctx, remote, registry).delete(data);
    session.remote.save()?;

    if let Err(err) = result {
        report_failure(&err);
        session.save(ctx)?;
        return Err(err).context("destroy failed");
    }

    ctx.store.remove(&session.key)?;
    if args.reuse {
        ui::success(&format!("Deactivated {name}; the remote service is kept"));
    } else {
        ui::success(&format!("Destroyed {name}"));
    }
    Ok(())
}
