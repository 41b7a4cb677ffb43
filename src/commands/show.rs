//! Read-only views of recorded and remote state

use super::Session;
use crate::Context;
use crate::cli::ServiceArgs;
use crate::ui;
use anyhow::{Context as _, Result};
use colored::Colorize;
use reconcile::{FieldKind, Version, keys};
use serde_json::Value;

pub fn show(ctx: &Context, args: &ServiceArgs) -> Result<()> {
    let session = Session::open(ctx, &args.file)?;
    let data = &session.data;

    ui::header(&format!("Service: {}", session.name()));
    let Some(id) = data.id() else {
        ui::info("Not created yet; run apply to create it");
        return Ok(());
    };
    ui::kv("id", id);
    for key in [keys::TYPE, keys::COMMENT, keys::ACTIVE_VERSION, keys::CLONED_VERSION] {
        if let Some(value) = data.get_observed(key) {
            ui::kv(key, &ui::format_value(value));
        }
    }
    ui::kv(
        "state file",
        &ctx.store.path_for(&session.key).display().to_string(),
    );

    let schema = session.registry.schema();
    for key in session.registry.keys() {
        let Some(value) = data.get_observed(key) else {
            continue;
        };
        let kind = schema.get(key).map(|f| f.kind);
        match (kind, value) {
            (Some(FieldKind::Collection), Value::Array(items)) => {
                ui::section(&format!("{key} ({})", items.len()));
                let identity = schema.get(key).and_then(|f| f.identity).unwrap_or("name");
                for item in items {
                    let name = item.get(identity).map_or_else(String::new, ui::format_value);
                    ui::dim(&name);
                }
            }
            (_, Value::Object(fields)) => {
                ui::section(key);
                for (field, value) in fields {
                    ui::kv(field, &ui::format_value(value));
                }
            }
            (_, other) => ui::kv(key, &ui::format_value(other)),
        }
    }

    if data.has_change(keys::NAME) || session.registry.iter().any(|h| h.has_change(data)) {
        println!();
        ui::warn("The service file differs from the recorded state; run plan for details");
    }
    Ok(())
}

pub fn versions(ctx: &Context, args: &ServiceArgs) -> Result<()> {
    let session = Session::open(ctx, &args.file)?;
    let Some(id) = session.data.id() else {
        ui::info(&format!("{} has not been created yet", session.name()));
        return Ok(());
    };
    let service = session
        .remote
        .transport()
        .get_service(id)
        .with_context(|| format!("Failed to read service {id}"))?;

    ui::header(&format!("Versions of {} ({})", service.name, service.id));
    for version in &service.versions {
        println!("  {}", version_line(version));
    }
    Ok(())
}

fn version_line(version: &Version) -> String {
    let marker = if version.active {
        "●".green().to_string()
    } else if version.locked {
        "○".dimmed().to_string()
    } else {
        "◌".yellow().to_string()
    };
    let status = if version.active {
        "active"
    } else if version.locked {
        "locked"
    } else {
        "draft"
    };
    let comment = version.comment.as_deref().unwrap_or_default();
    format!(
        "{marker} {:>4}  {:<8} {}",
        version.number,
        status,
        ui::truncate(comment, 60).dimmed()
    )
}
