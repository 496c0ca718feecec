use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use drivesync::logging;
use drivesync_core::SyncConfig;
use drivesync_engine::checkpoint::{CheckpointStore, JsonCheckpointStore};
use drivesync_engine::{EngineEvent, SyncController};

#[derive(Parser)]
#[command(name = "drivesync", version, about = "Mirror a cloud drive folder into a local directory")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "drivesync.toml")]
    config: PathBuf,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync engine until interrupted
    Start,
    /// Print a summary of the persisted checkpoint
    Status,
    /// Remove the persisted checkpoint; the next start re-syncs from
    /// scratch
    Erase,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level)?;

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Start => run(config).await,
        Commands::Status => status(config).await,
        Commands::Erase => erase(config).await,
    }
}

fn load_config(path: &PathBuf) -> Result<SyncConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: SyncConfig =
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(config)
}

async fn run(config: SyncConfig) -> Result<()> {
    let controller = Arc::new(SyncController::with_defaults(config)?);

    let mut events = controller.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::Syncing(active) => {
                    info!(active, "syncing");
                }
                EngineEvent::FilesChanged(summary) => {
                    info!(
                        added = summary.added,
                        removed = summary.removed,
                        updated = summary.updated,
                        trashed = summary.trashed,
                        "files changed"
                    );
                }
                EngineEvent::Error(message) => {
                    error!("engine error: {}", message);
                }
            }
        }
    });

    controller.start(|message| println!("{}", message)).await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    println!("Shutting down");
    controller.close().await;
    Ok(())
}

async fn status(config: SyncConfig) -> Result<()> {
    let dir = config
        .checkpoint_dir
        .clone()
        .unwrap_or_else(JsonCheckpointStore::default_dir);
    let store = JsonCheckpointStore::new(dir);

    match store.load(&config.account_id).await? {
        Some(checkpoint) => {
            println!("account:       {}", checkpoint.account_id);
            println!("synced:        {}", checkpoint.synced);
            println!("root id:       {}", checkpoint.root_id);
            println!(
                "change token:  {}",
                checkpoint.change_token.as_deref().unwrap_or("-")
            );
            println!("known records: {}", checkpoint.file_info.len());
            println!("local files:   {}", checkpoint.on_local_drive.len());
            println!("pending:       {}", checkpoint.changes_to_execute.len());
        }
        None => println!("No checkpoint for account {}", config.account_id),
    }
    Ok(())
}

async fn erase(config: SyncConfig) -> Result<()> {
    let dir = config
        .checkpoint_dir
        .clone()
        .unwrap_or_else(JsonCheckpointStore::default_dir);
    let store = JsonCheckpointStore::new(dir);
    store.erase(&config.account_id).await?;
    println!("Checkpoint erased for account {}", config.account_id);
    Ok(())
}
