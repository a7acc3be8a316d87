//! chantrackd - checkpointed channel tracking and batch message fetching.
//!
//! Two single-instance roles share one SQLite database: the tracker keeps
//! the channel registry synchronized with the external source, and the
//! fetcher pulls bounded message batches per channel, committing each batch
//! together with the channel's checkpoint pointers in one transaction.

mod config;
mod db;
mod error;
mod fetcher;
mod lock;
mod retry;
mod scheduler;
mod storage;
mod transport;

use crate::config::{Config, validation};
use crate::db::{Database, ResetFilter};
use crate::lock::LockFile;
use crate::scheduler::SyncScheduler;
use crate::transport::{MessageSource, NullSource};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chantrackd", version, about = "Channel tracking and batch message-fetch daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the registry synchronization daemon (tracker role).
    Track,
    /// Run the batch fetch daemon (fetcher role).
    Fetch {
        /// Stop after committing N batches (overrides the config value;
        /// 0 means unlimited).
        #[arg(long)]
        max_batches: Option<u64>,
    },
    /// Disaster recovery: purge batch records and reset the owning
    /// channels' checkpoints in one transaction. Run while stopped.
    Reset {
        /// Reset a single channel.
        #[arg(long, conflicts_with = "all")]
        channel: Option<i64>,
        /// Reset every channel.
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    let config = Config::load(&cli.config).map_err(|e| {
        error!(path = %cli.config.display(), error = %e, "Failed to load config");
        e
    })?;
    if let Err(errors) = validation::validate(&config) {
        for e in &errors {
            error!(error = %e, "Invalid configuration");
        }
        anyhow::bail!("configuration invalid ({} errors)", errors.len());
    }
    let config = Arc::new(config);
    let lock_dir = config.storage.lock_dir.clone();
    let lock_dir = Path::new(&lock_dir);

    match cli.command {
        Command::Track => {
            let _lock = LockFile::acquire(lock_dir, "tracker")?;
            let db = Database::new(&config.database.path).await?;
            let scheduler =
                SyncScheduler::new(db, make_source(), Arc::clone(&config), shutdown_token());
            info!("Starting chantrackd tracker");
            scheduler.run_tracker().await?;
        }

        Command::Fetch { max_batches } => {
            let _lock = LockFile::acquire(lock_dir, "fetcher")?;
            let db = Database::new(&config.database.path).await?;
            let max_batches = max_batches.unwrap_or(config.fetcher.max_batches);
            let scheduler =
                SyncScheduler::new(db, make_source(), Arc::clone(&config), shutdown_token());
            info!(max_batches, "Starting chantrackd fetcher");
            scheduler.run_fetcher(max_batches).await?;
        }

        Command::Reset { channel, all } => {
            // Take the fetcher lock so a reset can never race a live fetcher.
            let _lock = LockFile::acquire(lock_dir, "fetcher")?;
            let filter = match (channel, all) {
                (Some(id), false) => ResetFilter::Channel(id),
                (None, true) => ResetFilter::All,
                _ => anyhow::bail!("pass exactly one of --channel <id> or --all"),
            };
            let db = Database::new(&config.database.path).await?;
            let now = chrono::Utc::now().timestamp();
            let summary = db.batches().reset_channels(filter, now).await?;
            info!(
                batches_deleted = summary.batches_deleted,
                channels_reset = summary.channels_reset,
                "Reset complete"
            );
        }
    }

    Ok(())
}

/// The real transport client is deployment-specific and plugs in behind
/// [`MessageSource`]; without one, every transport call fails and is
/// recorded like any other outage.
fn make_source() -> Arc<dyn MessageSource> {
    warn!("No transport configured; transport calls will fail until one is wired in");
    Arc::new(NullSource)
}

/// Cancellation token wired to ctrl-c. Role loops observe it at their
/// suspension points and finish or abandon in-flight work cleanly.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_token.cancel();
        }
    });
    token
}
