use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing_subscriber::{EnvFilter, fmt};
use walletkit_bridge::WalletKitConfig;
use walletkit_bridge::durable::{DURABLE_EVENTS_KEY, DurableEventStore};
use walletkit_storage::{FileStorage, KeyValueStorage};

#[derive(Parser)]
#[command(name = "walletkit", about = "WalletKit bridge tooling: config checks and durable event inspection")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect bridge configuration files
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Inspect or prune persisted durable events
    #[command(subcommand)]
    Events(EventsCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Parse and validate a config file, then print the derived init parameters
    Check {
        /// Path to a TOML config file
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum EventsCommand {
    /// Print every durable event as one JSON object per line
    List {
        #[command(flatten)]
        target: StoreTarget,

        /// Only events not yet delivered to a handler
        #[arg(long)]
        pending: bool,
    },

    /// Drop events already delivered to a handler
    Purge {
        #[command(flatten)]
        target: StoreTarget,
    },

    /// Drop every durable event, delivered or not
    Clear {
        #[command(flatten)]
        target: StoreTarget,
    },
}

#[derive(clap::Args)]
struct StoreTarget {
    /// File storage directory (defaults to ~/.walletkit/storage)
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Limit to one engine, e.g. `mainnet@https://toncenter.com`
    #[arg(long)]
    engine: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries command output
    fmt()
        .with_env_filter(EnvFilter::from_env("WALLETKIT_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Config(ConfigCommand::Check { path }) => config_check(&path),
        Command::Events(EventsCommand::List { target, pending }) => events_list(&target, pending).await,
        Command::Events(EventsCommand::Purge { target }) => events_purge(&target).await,
        Command::Events(EventsCommand::Clear { target }) => events_clear(&target).await,
    }
}

fn config_check(path: &Path) -> Result<()> {
    let config = WalletKitConfig::from_file(path)
        .with_context(|| format!("invalid config {}", path.display()))?;

    let report = json!({
        "engineKey": config.engine_key(),
        "storagePath": config
            .persistent_storage_enabled()
            .then(|| config.storage_path().display().to_string()),
        "durability": format!("{:?}", config.bridge.durability),
        "init": config.init_params(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Durable stores found under the target directory, one per engine.
async fn stores(target: &StoreTarget) -> Result<Vec<(String, DurableEventStore)>> {
    let dir = target
        .storage_dir
        .clone()
        .unwrap_or_else(FileStorage::default_path);
    let storage = FileStorage::new(dir.clone());
    if !dir.is_dir() {
        bail!("storage directory {} does not exist", dir.display());
    }

    let keys = storage
        .keys()
        .await
        .with_context(|| format!("failed to read {}", dir.display()))?;
    let storage: Arc<dyn KeyValueStorage> = Arc::new(storage);

    let prefix = format!("{DURABLE_EVENTS_KEY}:");
    let mut found = Vec::new();
    for key in keys {
        let engine = if key == DURABLE_EVENTS_KEY {
            String::new()
        } else if let Some(engine) = key.strip_prefix(&prefix) {
            engine.to_string()
        } else {
            continue;
        };
        if target.engine.as_ref().is_some_and(|wanted| *wanted != engine) {
            continue;
        }
        found.push((engine, DurableEventStore::with_key(storage.clone(), key)));
    }
    tracing::debug!(dir = %dir.display(), stores = found.len(), "Durable stores found");
    Ok(found)
}

async fn events_list(target: &StoreTarget, pending: bool) -> Result<()> {
    for (engine, store) in stores(target).await? {
        let records = if pending { store.pending().await? } else { store.all().await? };
        for record in records {
            let mut line = serde_json::to_value(&record)?;
            if let Value::Object(fields) = &mut line {
                fields.insert("key".into(), Value::String(record.key.clone()));
                fields.insert("engine".into(), Value::String(engine.clone()));
            }
            println!("{line}");
        }
    }
    Ok(())
}

async fn events_purge(target: &StoreTarget) -> Result<()> {
    let mut total = 0;
    for (engine, store) in stores(target).await? {
        let purged = store.purge_completed().await?;
        tracing::info!(engine, purged, "Purged completed durable events");
        total += purged;
    }
    println!("purged {total} completed event(s)");
    Ok(())
}

async fn events_clear(target: &StoreTarget) -> Result<()> {
    let stores = stores(target).await?;
    for (engine, store) in &stores {
        store.clear().await?;
        tracing::info!(engine, "Cleared durable events");
    }
    println!("cleared {} store(s)", stores.len());
    Ok(())
}
