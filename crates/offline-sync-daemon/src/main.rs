//! Offline sync daemon - keeps chat messages and record changes flowing
//! through network partitions.

mod app;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sync_config_and_utils::{init_logging, Config, Paths};
use sync_queue::Resolution;

/// Offline sync daemon command-line interface.
#[derive(Parser)]
#[command(name = "offline-sync-daemon")]
#[command(about = "Durable message delivery and record sync for intermittent networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for runtime files (store, logs, config). Defaults to ~/.offline-sync
    #[arg(long, global = true, env = "OFFLINE_SYNC_BASE_DIR")]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon in the foreground
    Start,
    /// Show queue and conflict counters
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// List sync conflicts
    Conflicts {
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Resolve a sync conflict and apply the result remotely
    Resolve {
        /// Conflict id
        conflict_id: String,
        /// local, remote, or merge
        resolution: Resolution,
        /// Merged record as a JSON object (required for merge)
        #[arg(long)]
        merged: Option<String>,
        /// Run even if a daemon pid file exists
        #[arg(long)]
        force: bool,
    },
    /// Reset failed messages and sync items for another attempt
    RetryFailed {
        /// Only reset messages of this conversation
        #[arg(long)]
        conversation: Option<String>,
        /// Run even if a daemon pid file exists
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let config = Config::load(&paths)?;
    let level = cli.log_level.unwrap_or_else(|| config.log_level.clone());

    match cli.command {
        Some(Commands::Start) | None => {
            paths.ensure_dirs()?;
            init_logging(&level, Some(&paths.log_file()))?;
            app::run_daemon(config, paths).await?;
        }
        Some(Commands::Status { json }) => {
            init_logging(&level, None)?;
            app::check_status(&config, &paths, json)?;
        }
        Some(Commands::Conflicts { all, json }) => {
            init_logging(&level, None)?;
            app::list_conflicts(&config, &paths, all, json)?;
        }
        Some(Commands::Resolve {
            conflict_id,
            resolution,
            merged,
            force,
        }) => {
            init_logging(&level, None)?;
            app::resolve_conflict(&config, &paths, &conflict_id, resolution, merged.as_deref(), force)
                .await?;
        }
        Some(Commands::RetryFailed { conversation, force }) => {
            init_logging(&level, None)?;
            app::retry_failed(&config, &paths, conversation.as_deref(), force)?;
        }
    }

    Ok(())
}
