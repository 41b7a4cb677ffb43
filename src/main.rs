mod cli;
mod commands;
mod components;
mod config;
mod remote;
mod schema;
mod state;
mod ui;

use anyhow::{Context as _, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use config::ToolConfig;
use reconcile::CancelToken;
use state::StateStore;
use std::io;
use std::path::PathBuf;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub config: ToolConfig,
    pub store: StateStore,
    pub remote_path: PathBuf,
    pub cancel: CancelToken,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    if let Command::Completions { shell } = cli.command {
        generate(shell, &mut Cli::command(), "cdnver", &mut io::stdout());
        return Ok(());
    }

    let state_dir = match cli.state_dir {
        Some(dir) => dir,
        None => StateStore::default_dir()?,
    };
    let remote_path = cli
        .remote
        .unwrap_or_else(|| state_dir.join("remote.json"));

    // Ctrl-C stops between handlers; the draft keeps what was applied
    let cancel = CancelToken::new();
    let token = cancel.clone();
    ctrlc::set_handler(move || {
        log::warn!("Interrupt received, stopping after the current handler");
        token.cancel();
    })
    .context("Failed to install Ctrl-C handler")?;

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        config: ToolConfig::load(cli.config_file.as_deref())?,
        store: StateStore::new(state_dir),
        remote_path,
        cancel,
    };
    log::debug!(
        "State in {}, remote store at {}",
        ctx.store.dir().display(),
        ctx.remote_path.display()
    );

    match cli.command {
        Command::Plan(args) => commands::plan::run(&ctx, &args),
        Command::Apply(args) => commands::apply::apply(&ctx, &args),
        Command::Refresh(args) => commands::apply::refresh(&ctx, &args),
        Command::Destroy(args) => commands::apply::destroy(&ctx, &args),
        Command::Show(args) => commands::show::show(&ctx, &args),
        Command::Versions(args) => commands::show::versions(&ctx, &args),
        Command::Completions { .. } => Ok(()),
    }
}
