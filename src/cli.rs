use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cdnver")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Declarative, versioned CDN service configuration", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Tool configuration file (default: ~/.config/cdnver/config.toml)
    #[arg(long, global = true, env = "CDNVER_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Directory holding per-service state files
    #[arg(long, global = true, env = "CDNVER_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Remote store file (default: <state dir>/remote.json)
    #[arg(long, global = true, env = "CDNVER_REMOTE")]
    pub remote: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what apply would change
    Plan(ServiceArgs),

    /// Build, validate and activate a version matching the service file
    Apply(ApplyArgs),

    /// Refresh the recorded state from the remote service
    Refresh(ServiceArgs),

    /// Delete the service (or deactivate it for reuse)
    Destroy(DestroyArgs),

    /// Show the recorded state of a service
    Show(ServiceArgs),

    /// List the remote versions of a service
    Versions(ServiceArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Command Arguments
// ============================================================================

#[derive(Args, Clone)]
pub struct ServiceArgs {
    /// Service definition file
    #[arg(default_value = "service.toml")]
    pub file: PathBuf,
}

#[derive(Args, Clone)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub service: ServiceArgs,

    /// Build and validate, but leave the version inactive
    #[arg(long)]
    pub no_activate: bool,

    /// Skip reading the remote state before applying
    #[arg(long)]
    pub no_refresh: bool,
}

#[derive(Args, Clone)]
pub struct DestroyArgs {
    #[command(flatten)]
    pub service: ServiceArgs,

    /// Deactivate the active version before deleting
    #[arg(long)]
    pub force: bool,

    /// Deactivate, but keep the service for later reuse
    #[arg(long)]
    pub reuse: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}
