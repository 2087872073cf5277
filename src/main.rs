use anyhow::Context;
use clap::Parser;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use trade_engine::db::{MemoryStore, PostgresPersistence, Store};
use trade_engine::engine::{EngineManager, EngineServices};
use trade_engine::execution::{ConnectorRegistry, PaperConnector, RateLimiterRegistry};
use trade_engine::persistence::{MemoryPriceHistory, PriceHistory, RedisPersistence};
use trade_engine::retention::RetentionManager;
use trade_engine::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "trade-engine", about = "Indication-driven trading engine")]
struct Cli {
    /// Configuration file (defaults to config/default.toml + config/local.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Keep all state in memory; no Postgres or Redis required
    #[arg(long)]
    dry_run: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Only run these connection ids (repeatable)
    #[arg(long = "connection")]
    connections: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.json_logs);

    let config = EngineConfig::load_from(cli.config.as_deref()).context("loading configuration")?;
    tracing::info!("Trade engine starting: {}", config.digest());

    let connections = config.active_connections(&cli.connections);
    if connections.is_empty() {
        anyhow::bail!("no enabled connections to run");
    }

    let (store, history) = if cli.dry_run {
        tracing::info!("Dry run: state kept in memory");
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let history: Arc<dyn PriceHistory> = Arc::new(MemoryPriceHistory::new(config.indication.series_length));
        (store, history)
    } else {
        let store: Arc<dyn Store> = Arc::new(
            PostgresPersistence::new(&config.database.url, config.database.max_connections)
                .await
                .context("connecting to Postgres")?,
        );
        let history: Arc<dyn PriceHistory> = match &config.redis.url {
            Some(url) => Arc::new(RedisPersistence::new(url).await.context("connecting to Redis")?),
            None => {
                tracing::warn!("No Redis configured, price history kept in memory");
                Arc::new(MemoryPriceHistory::new(config.indication.series_length))
            }
        };
        (store, history)
    };

    let exchanges: BTreeSet<String> = connections.iter().map(|c| c.exchange.to_lowercase()).collect();
    let mut connectors = ConnectorRegistry::new();
    for (seed, exchange) in exchanges.iter().enumerate() {
        tracing::info!(exchange = %exchange, "Registering paper connector");
        connectors.register(Arc::new(PaperConnector::new(exchange, config.paper.clone(), seed as u64 + 1)));
    }

    let services = EngineServices {
        store: store.clone(),
        history: history.clone(),
        connectors: Arc::new(connectors),
        limiters: Arc::new(RateLimiterRegistry::new(config.rate_limits.clone())),
    };

    let markets: Vec<(String, String)> = connections
        .iter()
        .flat_map(|c| c.symbols.iter().map(move |s| (c.id.clone(), s.clone())))
        .collect();
    let retention = RetentionManager::new(store, history, config.retention.clone(), markets);
    let (retention_tx, retention_rx) = watch::channel(false);
    let retention_task = tokio::spawn(async move { retention.run(retention_rx).await });

    let mut manager = EngineManager::new(config, services);
    let failures = manager.start_all(&connections).await;
    if manager.running().is_empty() {
        let _ = retention_tx.send(true);
        anyhow::bail!("every connection failed to start ({} failures)", failures.len());
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    tracing::info!("Received Ctrl+C, shutting down");

    manager.stop_all().await;
    let _ = retention_tx.send(true);
    if let Err(e) = retention_task.await {
        tracing::error!("Retention task ended abnormally: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn setup_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trade_engine=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
