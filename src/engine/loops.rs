//! Per-connection services and the three loop cycles.
//!
//! * main: sample the ticker, detect indications, mark base and main trials
//! * preset: run preset strategies, mark preset trials
//! * real: mirror validated real positions, mark exchange positions

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use super::scheduler::{process_symbols, CycleOutcome, InFlightSymbols};
use super::EngineServices;
use crate::config::{ConnectionConfig, EngineConfig};
use crate::db::Store;
use crate::execution::OrderExecutor;
use crate::graduation::GraduationCoordinator;
use crate::indication::IndicationDetector;
use crate::market::{MarketSampler, PriceCache};
use crate::models::{LoopKind, TrialLevel};
use crate::pool::PoolManager;
use crate::strategy::PresetEvaluator;
use crate::Result;

/// Everything one connection's loops need, built once at startup
pub struct ConnectionContext {
    pub connection_id: String,
    pub symbols: Vec<String>,
    pub max_concurrency: usize,
    pub store: Arc<dyn Store>,
    cache: Arc<PriceCache>,
    sampler: MarketSampler,
    detector: IndicationDetector,
    coordinator: GraduationCoordinator,
    presets: PresetEvaluator,
    in_flight: [InFlightSymbols; 3],
}

impl ConnectionContext {
    pub fn build(
        connection: &ConnectionConfig,
        config: &EngineConfig,
        services: &EngineServices,
    ) -> Result<Self> {
        let connector = services.connectors.get(&connection.exchange)?;
        let limiter = services.limiters.for_exchange(&connection.exchange);

        let cache = Arc::new(PriceCache::new(
            services.history.clone(),
            Duration::from_millis(config.indication.price_cache_ttl_ms),
            config.indication.series_length,
        ));
        let sampler = MarketSampler::new(&connection.id, connector.clone(), limiter.clone(), cache.clone());

        let pool = Arc::new(PoolManager::new(
            services.store.clone(),
            config.pool.clone(),
            &config.indication,
        ));
        let detector = IndicationDetector::new(services.store.clone(), pool.clone(), config.indication.clone());
        let executor = Arc::new(OrderExecutor::new(
            services.store.clone(),
            connector,
            limiter,
            config.executor.clone(),
        ));
        let coordinator = GraduationCoordinator::new(
            services.store.clone(),
            pool,
            executor,
            config.graduation.clone(),
            config.sizing.clone(),
        );
        let presets = PresetEvaluator::new(services.store.clone(), config.preset.clone(), &config.indication);

        Ok(Self {
            connection_id: connection.id.clone(),
            symbols: connection.symbols.clone(),
            max_concurrency: config.engine.max_concurrency,
            store: services.store.clone(),
            cache,
            sampler,
            detector,
            coordinator,
            presets,
            in_flight: Default::default(),
        })
    }

    fn in_flight(&self, kind: LoopKind) -> &InFlightSymbols {
        match kind {
            LoopKind::Preset => &self.in_flight[0],
            LoopKind::Main => &self.in_flight[1],
            LoopKind::Real => &self.in_flight[2],
        }
    }

    pub async fn run_cycle(&self, kind: LoopKind) -> CycleOutcome {
        match kind {
            LoopKind::Main => self.main_cycle().await,
            LoopKind::Preset => self.preset_cycle().await,
            LoopKind::Real => self.real_cycle().await,
        }
    }

    async fn main_cycle(&self) -> CycleOutcome {
        process_symbols(
            LoopKind::Main,
            &self.connection_id,
            &self.symbols,
            self.max_concurrency,
            self.in_flight(LoopKind::Main),
            |symbol| async move { self.main_symbol(&symbol).await },
        )
        .await
    }

    async fn main_symbol(&self, symbol: &str) -> Result<()> {
        let tick = self.sampler.sample(symbol).await?;
        let series = self.cache.series(&self.connection_id, symbol).await?;
        let now = Utc::now();

        let detection = self
            .detector
            .detect_symbol(&self.connection_id, symbol, &series, now)
            .await?;
        let marks = self
            .coordinator
            .mark_trials(
                &self.connection_id,
                symbol,
                &[TrialLevel::Base, TrialLevel::Main],
                tick.price,
                now,
            )
            .await?;

        if detection.fired > 0 || marks.closed > 0 {
            tracing::debug!(
                connection = %self.connection_id,
                symbol = %symbol,
                fired = detection.fired,
                opened = detection.trials_opened,
                closed = marks.closed,
                promoted = marks.promoted,
                "Main cycle activity"
            );
        }
        Ok(())
    }

    async fn preset_cycle(&self) -> CycleOutcome {
        process_symbols(
            LoopKind::Preset,
            &self.connection_id,
            &self.symbols,
            self.max_concurrency,
            self.in_flight(LoopKind::Preset),
            |symbol| async move { self.preset_symbol(&symbol).await },
        )
        .await
    }

    async fn preset_symbol(&self, symbol: &str) -> Result<()> {
        let series = self.cache.series(&self.connection_id, symbol).await?;
        let Some(latest) = series.last() else {
            return Ok(());
        };
        let now = Utc::now();

        self.presets
            .evaluate_symbol(&self.connection_id, symbol, &series, now)
            .await?;
        self.coordinator
            .mark_trials(&self.connection_id, symbol, &[TrialLevel::Preset], latest.price, now)
            .await?;
        Ok(())
    }

    async fn real_cycle(&self) -> CycleOutcome {
        match self.coordinator.mirror_sweep(&self.connection_id).await {
            Ok(summary) if summary.considered > 0 => {
                tracing::info!(
                    connection = %self.connection_id,
                    mirrored = summary.mirrored,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    rejected = summary.rejected,
                    out_of_sync = summary.out_of_sync,
                    "Mirror sweep finished"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(connection = %self.connection_id, error = %e, "Mirror sweep failed");
            }
        }

        process_symbols(
            LoopKind::Real,
            &self.connection_id,
            &self.symbols,
            self.max_concurrency,
            self.in_flight(LoopKind::Real),
            |symbol| async move { self.real_symbol(&symbol).await },
        )
        .await
    }

    async fn real_symbol(&self, symbol: &str) -> Result<()> {
        let Some(price) = self.cache.latest_price(&self.connection_id, symbol).await? else {
            return Ok(());
        };
        self.coordinator
            .mark_exchange_positions(&self.connection_id, symbol, price)
            .await?;
        Ok(())
    }
}
