//! rudder: operator CLI for the GitOps reconciliation controller.
//!
//! # Usage
//!
//! ```text
//! rudder app list [--json]
//! rudder app get <name> [--json]
//! rudder diff <name>
//! rudder sync <name> [--dry-run] [--force] [--prune]
//! rudder refresh <name>
//! rudder terminate <name>
//! rudder delete <name> [--cascade]
//! rudder daemon start|stop|status
//! ```
//!
//! Commands that act on an Application go through the daemon socket when a
//! daemon is listening and run in-process otherwise.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    app::AppCommand, daemon::DaemonCommand, delete::DeleteArgs, diff::DiffArgs,
    sync::{RefreshArgs, SyncArgs},
    terminate::TerminateArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "rudder",
    version,
    about = "Reconcile declared application state into a target environment",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect Applications and their recorded status.
    App {
        #[command(subcommand)]
        command: AppCommand,
    },

    /// Show unified diffs of live against desired state.
    Diff(DiffArgs),

    /// Converge an Application now.
    Sync(SyncArgs),

    /// Re-evaluate an Application without a manual sync.
    Refresh(RefreshArgs),

    /// Stop the in-flight sync operation of an Application.
    Terminate(TerminateArgs),

    /// Remove an Application, optionally with its managed resources.
    Delete(DeleteArgs),

    /// Run or query the background controller.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::App { command } => commands::app::run(command),
        Commands::Diff(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Refresh(args) => args.run(),
        Commands::Terminate(args) => args.run(),
        Commands::Delete(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
