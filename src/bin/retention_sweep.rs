//! Run one retention pass against the configured database and exit.

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use trade_engine::db::{PostgresPersistence, Store};
use trade_engine::persistence::{MemoryPriceHistory, PriceHistory, RedisPersistence};
use trade_engine::retention::RetentionManager;
use trade_engine::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "retention-sweep", about = "Run a single retention sweep")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trade_engine=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load_from(cli.config.as_deref()).context("loading configuration")?;

    let store: Arc<dyn Store> = Arc::new(
        PostgresPersistence::new(&config.database.url, config.database.max_connections)
            .await
            .context("connecting to Postgres")?,
    );
    let history: Arc<dyn PriceHistory> = match &config.redis.url {
        Some(url) => Arc::new(RedisPersistence::new(url).await.context("connecting to Redis")?),
        None => Arc::new(MemoryPriceHistory::new(1)),
    };

    let markets: Vec<(String, String)> = config
        .connections
        .iter()
        .flat_map(|c| c.symbols.iter().map(move |s| (c.id.clone(), s.clone())))
        .collect();

    let report = RetentionManager::new(store, history, config.retention.clone(), markets)
        .sweep(Utc::now())
        .await
        .context("retention sweep")?;

    for r in &report.reorganized {
        println!(
            "{:<8} {:<20} rows={:<8} archived={}",
            r.table.as_str(),
            r.connection_id,
            r.row_count,
            r.archived
        );
    }
    if let Some(purge) = &report.aggressive {
        println!(
            "aggressive: archives={} snapshots={} log_entries={}",
            purge.archives, purge.snapshots, purge.log_entries
        );
    }
    println!(
        "{} reorganized, {} failed",
        report.reorganized.len(),
        report.failures
    );

    if report.failures > 0 {
        anyhow::bail!("{} reorganizations failed", report.failures);
    }
    Ok(())
}
