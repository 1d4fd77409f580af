//! Folio CLI - operator tooling for the local sync engine.
//!
//! Inspects and drives the outbound queue, the pending log and the change
//! feed of a local Folio store.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use folio_remote::{FeedKey, HttpRemote, HttpRemoteConfig};
use folio_sync::{EngineConfig, FeedStatus, SyncEngine};

#[derive(Parser)]
#[command(name = "folio")]
#[command(about = "Folio - local-first sync engine tooling")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Engine configuration file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Local database path (overrides the configuration).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Base URL of the remote authority.
    #[arg(long, global = true, default_value = "http://localhost:3000/")]
    remote: String,

    /// Bearer token for the remote (overrides the configuration).
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue, pending-log and feed statistics.
    Stats,

    /// Run one flush cycle and print its report.
    Flush,

    /// Delete failed queue items.
    ClearFailed,

    /// List pending local changes.
    Pending {
        /// Only show this table.
        #[arg(short, long)]
        table: Option<String>,
    },

    /// Delete failed pending entries older than the error TTL.
    PruneErrors,

    /// Fetch one snapshot of a table from the remote.
    Snapshot {
        /// Table name.
        #[arg(short, long)]
        table: String,

        /// Row filter, e.g. "kind = 'book'".
        #[arg(short = 'w', long = "where")]
        predicate: Option<String>,

        /// Comma-separated column list.
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,
    },

    /// Run the engine until interrupted, following the given tables.
    Run {
        /// Tables to subscribe to.
        #[arg(short, long, required = true)]
        table: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .init();

    let config = load_config(&cli).await?;
    let engine = open_engine(&cli, config)?;

    match cli.command {
        Commands::Stats => cmd_stats(&engine).await,
        Commands::Flush => cmd_flush(&engine).await,
        Commands::ClearFailed => cmd_clear_failed(&engine).await,
        Commands::Pending { table } => cmd_pending(&engine, table.as_deref()).await,
        Commands::PruneErrors => cmd_prune_errors(&engine).await,
        Commands::Snapshot {
            table,
            predicate,
            columns,
        } => cmd_snapshot(&engine, table, predicate, columns).await,
        Commands::Run { table } => cmd_run(&engine, table).await,
    }
}

/// Resolve configuration from file, flags and defaults.
async fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if let Some(db) = &cli.db {
        config.store_path = Some(db.clone());
    }
    if config.store_path.is_none() {
        config.store_path = Some(default_store_path()?);
    }
    if let Some(token) = &cli.token {
        config.flush.auth_token = Some(token.clone());
    }
    Ok(config)
}

fn default_store_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("folio");
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    Ok(data_dir.join("folio.db"))
}

fn open_engine(cli: &Cli, config: EngineConfig) -> Result<SyncEngine<HttpRemote>> {
    let base_url = Url::parse(&cli.remote).context("Invalid remote URL")?;
    let mut remote = HttpRemote::new(HttpRemoteConfig::new(base_url), config.shapes.clone())
        .context("Failed to create remote client")?;
    if let Some(token) = &config.flush.auth_token {
        remote = remote.with_feed_token(token.clone());
    }

    if let Some(path) = &config.store_path {
        info!("Using store at {}", path.display());
    }
    SyncEngine::new(Arc::new(remote), config).context("Failed to open sync engine")
}

async fn cmd_stats(engine: &SyncEngine<HttpRemote>) -> Result<()> {
    let stats = engine.stats().await.context("Failed to read stats")?;

    println!("Queue: {} items", stats.queue.total);
    for (status, count) in &stats.queue.by_status {
        println!("  {:<10} {}", status.as_str(), count);
    }
    for (table, count) in &stats.queue.by_table {
        println!("  table {:<16} {}", table, count);
    }
    if !stats.queue.stuck.is_empty() {
        println!("Stuck items:");
        for intent in &stats.queue.stuck {
            println!(
                "  {} {} {} (retries: {}, error: {})",
                intent.id,
                intent.operation,
                intent.table,
                intent.retry_count,
                intent.error.as_deref().unwrap_or("-")
            );
        }
    }

    println!("Pending log:");
    for (status, count) in &stats.pending {
        println!("  {:<10} {}", status.as_str(), count);
    }
    println!("Cleanup passes: {}", stats.cleanup_passes);
    println!("Session: {}", if stats.session_active { "active" } else { "none" });
    Ok(())
}

async fn cmd_flush(engine: &SyncEngine<HttpRemote>) -> Result<()> {
    engine.outbox().recover_interrupted().await?;
    let report = engine.flush_now().await;
    println!(
        "Attempted {}, applied {}, failed {}, evicted {}",
        report.attempted, report.applied, report.failed, report.evicted
    );
    Ok(())
}

async fn cmd_clear_failed(engine: &SyncEngine<HttpRemote>) -> Result<()> {
    let removed = engine.clear_failed().await.context("Failed to clear queue")?;
    println!("Removed {} failed items", removed);
    Ok(())
}

async fn cmd_pending(engine: &SyncEngine<HttpRemote>, table: Option<&str>) -> Result<()> {
    let entries = match table {
        Some(table) => engine.pending().list(table).await?,
        None => engine.pending().list_all().await?,
    };

    if entries.is_empty() {
        println!("No pending changes");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{:>6}  {:<12} {:<8} {:<8} {:<36} {}",
            entry.local_id,
            entry.table,
            entry.operation.as_str(),
            entry.status.as_str(),
            entry.entity_id,
            entry.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_prune_errors(engine: &SyncEngine<HttpRemote>) -> Result<()> {
    let removed = engine.prune_errors().await.context("Failed to prune")?;
    println!("Pruned {} expired entries", removed);
    Ok(())
}

async fn cmd_snapshot(
    engine: &SyncEngine<HttpRemote>,
    table: String,
    predicate: Option<String>,
    columns: Option<Vec<String>>,
) -> Result<()> {
    let mut key = FeedKey::table(table);
    if let Some(predicate) = predicate {
        key = key.with_predicate(predicate);
    }
    if let Some(columns) = columns {
        key = key.with_columns(columns);
    }

    let rows = engine
        .query_snapshot(&key)
        .await
        .with_context(|| format!("Failed to fetch {}", key))?;
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

async fn cmd_run(engine: &SyncEngine<HttpRemote>, tables: Vec<String>) -> Result<()> {
    engine.start().await.context("Failed to start engine")?;

    let mut handles = Vec::new();
    for table in tables {
        handles.push(engine.subscribe(FeedKey::table(table)).await);
    }

    info!("Following {} tables, press Ctrl-C to stop", handles.len());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    for handle in &handles {
        let state = handle.state();
        let status = match state.sync_status {
            FeedStatus::Synced => "synced".to_string(),
            other => format!("{} ({})", other, state.error.as_deref().unwrap_or("-")),
        };
        println!("{}: {} rows, {}", handle.key(), state.data.len(), status);
    }

    engine.shutdown().await;
    Ok(())
}
