//! Preview of what apply would do, without touching the remote

use super::{Session, orchestrator};
use crate::Context;
use crate::cli::ServiceArgs;
use crate::ui;
use anyhow::{Context as _, Result};
use colored::Colorize;
use reconcile::{
    DiffResult, DiffSummary, DraftDecision, HandlerRegistry, Orchestrator, ResourceData,
    Transport, keys,
};

/// How apply would get a version to write to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Draft {
    /// Nothing version-scoped changes
    Unchanged,
    /// The service is new; version 1 is written directly
    Initial,
    /// A mutable version is reused as is
    Reuse(u32),
    /// The locked version is cloned first
    Clone { from: u32 },
}

impl From<DraftDecision> for Draft {
    fn from(decision: DraftDecision) -> Self {
        match decision {
            DraftDecision::Reuse(number) => Self::Reuse(number),
            DraftDecision::Clone { from } => Self::Clone { from },
        }
    }
}

/// Planned changes for one handler
#[derive(Debug, Clone)]
pub struct HandlerPlan {
    pub key: &'static str,
    /// Record-level diff, for collection handlers
    pub diff: Option<DiffResult>,
}

/// Everything apply would change
#[derive(Debug, Clone)]
pub struct Plan {
    pub service: String,
    pub create: bool,
    /// Service-scoped keys that change in place
    pub service_changes: Vec<&'static str>,
    pub version_comment: bool,
    pub draft: Draft,
    pub handlers: Vec<HandlerPlan>,
    pub activate: bool,
    /// A mutable version that apply would activate without new changes
    pub pending_activation: Option<u32>,
}

impl Plan {
    pub fn has_changes(&self) -> bool {
        self.create
            || !self.service_changes.is_empty()
            || self.draft != Draft::Unchanged
            || self.pending_activation.is_some()
    }

    /// Record counts across all collection handlers
    pub fn summary(&self) -> DiffSummary {
        let mut summary = DiffSummary::default();
        for handler in &self.handlers {
            if let Some(diff) = &handler.diff {
                summary.merge(&diff.summary());
            }
        }
        summary
    }
}

/// Work out what apply would do for `data`.
///
/// Uses the orchestrator's own draft decisions without calling any
/// mutating endpoint.
pub fn build(
    registry: &HandlerRegistry,
    data: &ResourceData,
    transport: &dyn Transport,
) -> reconcile::Result<Plan> {
    registry.schema().validate(data.declared())?;

    let create = data.id().is_none();
    let service = match data.id() {
        Some(id) => Some(transport.get_service(id)?),
        None => None,
    };

    let mut service_changes = Vec::new();
    if !create {
        for key in [keys::NAME, keys::COMMENT] {
            if data.has_change(key) {
                service_changes.push(key);
            }
        }
    }

    let mut handlers = Vec::new();
    for handler in registry.iter() {
        if handler.must_process(data, create) {
            handlers.push(HandlerPlan {
                key: handler.key(),
                diff: handler.preview(data)?,
            });
        }
    }
    let version_comment = data.has_change(keys::VERSION_COMMENT);
    let activate = data.get_bool(keys::ACTIVATE, true)?;

    let draft = match &service {
        _ if create => Draft::Initial,
        _ if handlers.is_empty() && !version_comment => Draft::Unchanged,
        Some(service) => Orchestrator::plan_draft(service, data)?.into(),
        None => Draft::Unchanged,
    };

    let pending_activation = match (&service, &draft) {
        (Some(service), Draft::Unchanged) if activate => {
            Orchestrator::pending_activation(service, data)?
        }
        _ => None,
    };

    Ok(Plan {
        service: data.get_str(keys::NAME)?.unwrap_or_default().to_string(),
        create,
        service_changes,
        version_comment,
        draft,
        handlers,
        activate,
        pending_activation,
    })
}

pub fn run(ctx: &Context, args: &ServiceArgs) -> Result<()> {
    let mut session = Session::open(ctx, &args.file)?;

    let Session {
        registry,
        data,
        remote,
        ..
    } = &mut session;
    if data.id().is_some() {
        // Refreshes an in-memory copy only; plan never saves
        orchestrator(ctx, remote, registry)
            .read(data)
            .context("Failed to refresh remote state")?;
    }

    let plan = build(registry, data, remote.transport()).context("Failed to build plan")?;
    display(&plan, ctx.verbose > 0);
    Ok(())
}

// ============================================================================
// Display
// ============================================================================

fn display(plan: &Plan, verbose: bool) {
    if !plan.has_changes() {
        println!();
        println!("  {} No changes needed", "✓".green());
        return;
    }

    println!();
    println!(
        "┌─ {} ─────────────────────────────────────────┐",
        format!("Plan: {}", plan.service).bold()
    );
    println!("│");

    if plan.create {
        println!("│ {} create service {}", "+".green(), plan.service.bold());
    }
    for key in &plan.service_changes {
        println!("│ {} service {} {}", "~".yellow(), key, "(in place)".dimmed());
    }

    let draft = match &plan.draft {
        Draft::Unchanged => None,
        Draft::Initial => Some("write version 1".to_string()),
        Draft::Reuse(n) => Some(format!("reuse mutable version {n}")),
        Draft::Clone { from } => Some(format!("clone locked version {from}")),
    };
    if let Some(draft) = draft {
        println!("│ {} {}", "→".blue(), draft);
    }
    if plan.version_comment {
        println!("│ {} version comment", "~".yellow());
    }
    println!("│");

    for handler in &plan.handlers {
        println!("│ {}", handler.key.bold());
        match &handler.diff {
            Some(diff) => display_records(diff, verbose),
            None => println!("│   {} {}", "~".yellow(), "changed".dimmed()),
        }
        println!("│");
    }

    if let Some(version) = plan.pending_activation {
        println!(
            "│ {} activate version {} {}",
            "→".blue(),
            version,
            "(built earlier, never activated)".dimmed()
        );
        println!("│");
    }

    println!("├─────────────────────────────────────────────────────┤");
    let summary = plan.summary();
    println!(
        "│ Summary: {} ({} handler(s))",
        summary.to_string().bold(),
        plan.handlers.len()
    );
    if plan.draft != Draft::Unchanged {
        if plan.activate {
            println!("│ The new version is validated, then activated");
        } else {
            println!(
                "│ The new version is validated and left {}",
                "inactive".yellow()
            );
        }
    }
    println!("└─────────────────────────────────────────────────────┘");
}

fn display_records(diff: &DiffResult, verbose: bool) {
    for record in &diff.added {
        println!("│   {} {}", "+".green(), ui::truncate(&label(record), 60));
    }
    for record in &diff.deleted {
        println!("│   {} {}", "-".red(), ui::truncate(&label(record), 60));
    }
    for modified in diff.changed() {
        let fields: Vec<String> = modified
            .changes
            .iter()
            .map(|(field, value)| format!("{field} = {}", ui::format_value(value)))
            .collect();
        println!(
            "│   {} {:<30} {}",
            "~".yellow(),
            modified.identity,
            ui::truncate(&fields.join(", "), 60).dimmed()
        );
    }
    if verbose {
        let unchanged = diff.modified.len() - diff.changed().count();
        if unchanged > 0 {
            println!("│   {}", format!("{unchanged} unchanged").dimmed());
        }
    }
}

/// Short description of a record: its fields in order
fn label(record: &reconcile::Record) -> String {
    record
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(field, value)| format!("{field}={}", ui::format_value(value)))
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Tests
// ============================================================================
