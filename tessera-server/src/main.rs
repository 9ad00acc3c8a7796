//! Tessera daemon - hosts the storage engine with its background monitors

mod monitor;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::catalog::InMemoryCatalog;
use tessera_core::config::EngineConfig;
use tessera_core::storage::{EngineContext, FileNodeManager};
use tracing::info;

#[derive(Parser)]
#[command(name = "tessera")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Tessera time-series storage daemon")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory, overrides the configuration file
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    info!("Starting Tessera v{}", tessera_core::VERSION);
    info!("Data directory: {:?}", config.data_dir);

    let catalog = InMemoryCatalog::with_storage_groups(&config.storage_groups)?;
    let mem_interval = Duration::from_millis(config.mem_monitor_interval_ms);
    let merge_interval = Duration::from_secs(config.merge_interval_secs);
    let ctx = EngineContext::new(config)?;
    let manager = Arc::new(FileNodeManager::new(ctx, Arc::new(catalog)));

    let recovering = manager.clone();
    tokio::task::spawn_blocking(move || recovering.recovery()).await??;

    let mem_monitor = monitor::spawn_memory_monitor(manager.clone(), mem_interval);
    let merger = (!merge_interval.is_zero())
        .then(|| monitor::spawn_periodic_merge(manager.clone(), merge_interval));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    mem_monitor.abort();
    if let Some(merger) = merger {
        merger.abort();
    }

    let closing = manager.clone();
    tokio::task::spawn_blocking(move || closing.close_all()).await??;
    manager.context().flush_pool.shutdown();
    manager.context().merge_pool.shutdown();
    info!("Tessera shutdown complete");
    Ok(())
}
