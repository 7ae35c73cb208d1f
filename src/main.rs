//! Courier — bridge a group-chat transport to per-group agent workers.
//!
//! Courier polls a message transport, routes each conversation group's
//! backlog to at most one running worker process at a time, and persists
//! cursors so no message is handled twice or dropped across restarts.

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use std::path::{Path, PathBuf};

use courier::config::Config;
use courier::daemon;
use courier::group::{Group, GroupRegistry};
use courier::store::CursorStore;

/// Courier — route group conversations to agent workers.
#[derive(Parser)]
#[command(name = "courier", version, about)]
struct Cli {
    /// Working directory (defaults to current directory).
    #[arg(short = 'C', long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage the persistent daemon (transport poll + worker dispatch).
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },

    /// Manage registered conversation groups.
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },

    /// Show daemon and cursor status.
    Status,
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Start the daemon (backgrounds by default).
    Start {
        /// Run in foreground instead of daemonizing.
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the running daemon.
    Stop,
    /// Restart the daemon.
    Restart,
}

#[derive(Subcommand)]
enum GroupAction {
    /// Register a group (re-registering overwrites its metadata).
    Add {
        /// Group ID as the transport reports it.
        group_id: String,

        /// Display name (defaults to the group ID).
        #[arg(long)]
        name: Option<String>,

        /// Worker working-directory name (defaults to the group ID).
        #[arg(long)]
        folder: Option<String>,

        /// Dispatch on every message instead of requiring the trigger phrase.
        #[arg(long)]
        no_trigger: bool,
    },
    /// List registered groups.
    List,
    /// Remove a group registration.
    Remove {
        /// Group ID to remove.
        group_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let cwd = match &cli.dir {
        Some(d) => d.clone(),
        None => std::env::current_dir().wrap_err("failed to get current directory")?,
    };

    match cli.command {
        Command::Daemon { action } => match action {
            DaemonAction::Start { foreground } => daemon::start(&cwd, foreground).await,
            DaemonAction::Stop => daemon::stop(&cwd),
            DaemonAction::Restart => {
                let _ = daemon::stop(&cwd);
                daemon::start(&cwd, false).await
            }
        },
        Command::Group { action } => match action {
            GroupAction::Add {
                group_id,
                name,
                folder,
                no_trigger,
            } => cmd_group_add(&cwd, group_id, name, folder, no_trigger),
            GroupAction::List => cmd_group_list(&cwd),
            GroupAction::Remove { group_id } => cmd_group_remove(&cwd, &group_id),
        },
        Command::Status => daemon::status(&cwd),
    }
}

fn cmd_group_add(
    cwd: &Path,
    group_id: String,
    name: Option<String>,
    folder: Option<String>,
    no_trigger: bool,
) -> Result<()> {
    let state_dir = Config::state_dir(cwd);
    let mut registry = GroupRegistry::load(&state_dir);

    let group = Group {
        name: name.unwrap_or_else(|| group_id.clone()),
        folder: folder.unwrap_or_else(|| group_id.clone()),
        requires_trigger: !no_trigger,
        registered_at: chrono::Utc::now(),
        group_id,
    };
    let id = group.group_id.clone();
    let fresh = registry.register(group);
    registry.save()?;

    if fresh {
        println!("Registered group {id}");
    } else {
        println!("Updated group {id}");
    }
    Ok(())
}

fn cmd_group_list(cwd: &Path) -> Result<()> {
    let state_dir = Config::state_dir(cwd);
    let registry = GroupRegistry::load(&state_dir);

    let groups = registry.all();
    if groups.is_empty() {
        println!("No groups registered. Run `courier group add <group-id>`.");
        return Ok(());
    }
    for group in groups {
        println!(
            "{} ({}) folder={} trigger={}",
            group.group_id,
            group.name,
            group.folder,
            if group.requires_trigger { "required" } else { "always" },
        );
    }
    Ok(())
}

fn cmd_group_remove(cwd: &Path, group_id: &str) -> Result<()> {
    let state_dir = Config::state_dir(cwd);
    let mut registry = GroupRegistry::load(&state_dir);

    if registry.remove(group_id) {
        registry.save()?;
        // Drop the group's cursors too, so a re-registration starts clean.
        let mut store = CursorStore::load(&state_dir);
        store.remove_group(group_id)?;
        println!("Removed group {group_id}.");
    } else {
        println!("No group {group_id} registered.");
    }
    Ok(())
}
