//! Base → Main → Real → Exchange promotion.
//!
//! Trial closes drive the first two steps. Mirroring of validated real
//! positions and marking of live exchange positions run from the real
//! positions loop. Volume and leverage are computed here and nowhere
//! upstream.

pub mod sizing;
pub mod stats;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{GraduationConfig, SizingConfig};
use crate::db::Store;
use crate::execution::{OrderExecutor, OrderRequest};
use crate::models::{
    CloseReason, ExchangePosition, ExchangePositionStatus, OrderSide, OrderType, Phase,
    PseudoPositionTrial, RealPseudoPosition, RealStatus, SyncStatus, TrialLevel,
};
use crate::pool::PoolManager;
use crate::positions::{mark_exchange_position, mark_trial};
use crate::{EngineError, Result};

pub use sizing::{size_position, PositionSize};
pub use stats::TrialStats;

/// Profit factors are stored capped; a loss-free window is unbounded
const MAX_STORED_PROFIT_FACTOR: f64 = 999.0;

/// Promotion produced by a trial close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    None,
    Main(Uuid),
    Real(Uuid),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkSummary {
    pub marked: usize,
    pub closed: usize,
    pub promoted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorSummary {
    pub considered: usize,
    /// Profit factor below the mirror threshold; retried next sweep
    pub skipped: usize,
    pub mirrored: usize,
    pub failed: usize,
    pub rejected: usize,
    /// An order may be live without a local exchange position
    pub out_of_sync: usize,
}

/// Where a mirror attempt stopped
enum MirrorFailure {
    /// Nothing reached the exchange; the attempt may be repeated
    Retryable(EngineError),
    /// An order was, or may have been, placed
    Unsynced {
        error: EngineError,
        exchange_order_id: Option<String>,
    },
}

pub struct GraduationCoordinator {
    store: Arc<dyn Store>,
    pool: Arc<PoolManager>,
    executor: Arc<OrderExecutor>,
    config: GraduationConfig,
    sizing: SizingConfig,
}

impl GraduationCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        pool: Arc<PoolManager>,
        executor: Arc<OrderExecutor>,
        config: GraduationConfig,
        sizing: SizingConfig,
    ) -> Self {
        Self {
            store,
            pool,
            executor,
            config,
            sizing,
        }
    }

    /// Mark every open trial of `levels` for a symbol at `price`, persist the
    /// marks, and route each newly closed trial through graduation. A close is
    /// persisted before graduation runs, so a graduation error is logged and
    /// the remaining trials are still marked.
    pub async fn mark_trials(
        &self,
        connection_id: &str,
        symbol: &str,
        levels: &[TrialLevel],
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<MarkSummary> {
        let mut summary = MarkSummary::default();
        let trials = self.store.open_trials(connection_id, symbol, levels).await?;

        for mut trial in trials {
            summary.marked += 1;
            match mark_trial(&mut trial, price, now) {
                None => self.store.update_trial_marks(&trial).await?,
                Some(reason) => {
                    if !self.store.close_trial(&trial).await? {
                        continue;
                    }
                    summary.closed += 1;
                    tracing::debug!(
                        trial_id = %trial.id,
                        level = %trial.level,
                        symbol = %symbol,
                        reason = %reason,
                        pnl = trial.realized_pnl.unwrap_or(0.0),
                        "Trial closed"
                    );
                    match self.on_trial_closed(&trial, now).await {
                        Ok(Promotion::None) => {}
                        Ok(_) => summary.promoted += 1,
                        Err(e) => tracing::error!(
                            trial_id = %trial.id,
                            symbol = %symbol,
                            error = %e,
                            "Graduation after close failed"
                        ),
                    }
                }
            }
        }

        Ok(summary)
    }

    /// React to a persisted trial close
    pub async fn on_trial_closed(&self, trial: &PseudoPositionTrial, now: DateTime<Utc>) -> Result<Promotion> {
        let Some(aggregate_id) = trial.aggregate_id else {
            return Ok(Promotion::None);
        };

        match trial.level {
            TrialLevel::Base => {
                let pnl = trial.realized_pnl.unwrap_or(0.0);
                let recorded = self
                    .pool
                    .record_close(aggregate_id, pnl, trial.is_win(), trial.max_adverse_pct)
                    .await?;
                if recorded.is_none() {
                    return Ok(Promotion::None);
                }
                self.try_promote_main(aggregate_id, trial, now).await
            }
            TrialLevel::Main => self.try_promote_real(aggregate_id, trial, now).await,
            TrialLevel::Preset => Ok(Promotion::None),
        }
    }

    /// Open the aggregate's main trial when its profit factor and sample
    /// size qualify; at most one main trial per aggregate is active
    async fn try_promote_main(
        &self,
        aggregate_id: Uuid,
        closed: &PseudoPositionTrial,
        now: DateTime<Utc>,
    ) -> Result<Promotion> {
        let aggregate = self
            .store
            .get_aggregate(aggregate_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("aggregate {}", aggregate_id)))?;

        if aggregate.phase == Phase::Failed
            || aggregate.total_positions < self.config.main_min_positions
            || aggregate.profit_factor() < self.config.main_min_profit_factor
        {
            return Ok(Promotion::None);
        }

        let entry = closed.close_price.unwrap_or(closed.current_price);
        let main = PseudoPositionTrial::open(
            TrialLevel::Main,
            Some(aggregate.id),
            aggregate.key.clone(),
            entry,
            now,
        );
        if !self.store.insert_main_trial(&main).await? {
            return Ok(Promotion::None);
        }

        tracing::info!(
            aggregate_id = %aggregate.id,
            trial_id = %main.id,
            symbol = %aggregate.key.symbol,
            profit_factor = aggregate.profit_factor(),
            "Promoted configuration to main"
        );
        Ok(Promotion::Main(main.id))
    }

    /// Validate a closed main trial for live trading from the recent main
    /// history of its aggregate
    async fn try_promote_real(
        &self,
        aggregate_id: Uuid,
        main: &PseudoPositionTrial,
        now: DateTime<Utc>,
    ) -> Result<Promotion> {
        let history = self
            .store
            .count_closed_trials(aggregate_id, TrialLevel::Main)
            .await?;
        if history < self.config.real_min_main_trials {
            return Ok(Promotion::None);
        }

        let window = self
            .store
            .closed_trials(aggregate_id, &[TrialLevel::Main], self.config.real_window)
            .await?;
        let stats = TrialStats::from_trials(&window);
        let profit_factor = stats.profit_factor();

        if profit_factor < self.config.real_min_profit_factor
            || stats.avg_drawdown_hours > self.config.real_max_drawdown_hours
        {
            tracing::debug!(
                aggregate_id = %aggregate_id,
                profit_factor,
                avg_drawdown_hours = stats.avg_drawdown_hours,
                "Main trial did not validate"
            );
            return Ok(Promotion::None);
        }

        let key = &main.key;
        let reference = main.close_price.unwrap_or(main.current_price);
        let real = RealPseudoPosition {
            id: Uuid::new_v4(),
            connection_id: key.connection_id.clone(),
            symbol: key.symbol.clone(),
            direction: key.direction,
            main_trial_id: main.id,
            aggregate_id,
            status: RealStatus::Validated,
            reference_price: reference,
            take_profit_price: key.take_profit_price(reference),
            stop_loss_price: key.stop_loss_price(reference),
            take_profit_pct: key.take_profit_pct(),
            stop_loss_pct: key.stop_loss_pct(),
            trailing_enabled: key.trailing_enabled,
            trail_start: key.trail_start,
            trail_stop: key.trail_stop,
            profit_factor: profit_factor.min(MAX_STORED_PROFIT_FACTOR),
            avg_drawdown_hours: stats.avg_drawdown_hours,
            mirror_attempts: 0,
            created_at: now,
            updated_at: now,
        };

        if !self.store.insert_real_position(&real).await? {
            return Ok(Promotion::None);
        }

        tracing::info!(
            real_id = %real.id,
            main_trial_id = %main.id,
            symbol = %real.symbol,
            direction = %real.direction,
            profit_factor,
            "Validated real position"
        );
        Ok(Promotion::Real(real.id))
    }

    /// Mirror up to `mirror_batch_size` validated real positions.
    ///
    /// Candidates come least recently looked at first, and a deferred
    /// position moves to the back of the queue, so positions that never
    /// qualify cannot hold newer ones out of the batch.
    pub async fn mirror_sweep(&self, connection_id: &str) -> Result<MirrorSummary> {
        let mut summary = MirrorSummary::default();
        let candidates = self
            .store
            .validated_real_positions(connection_id, self.config.mirror_batch_size)
            .await?;

        for real in candidates {
            summary.considered += 1;

            let window = self
                .store
                .closed_trials(
                    real.aggregate_id,
                    &[TrialLevel::Base, TrialLevel::Main],
                    self.config.mirror_window,
                )
                .await?;
            let profit_factor = TrialStats::from_trials(&window).profit_factor();
            if profit_factor < self.config.mirror_min_profit_factor {
                summary.skipped += 1;
                self.store.defer_real_position(real.id).await?;
                tracing::debug!(real_id = %real.id, profit_factor, "Mirror deferred");
                continue;
            }

            if !self.store.claim_real_position(real.id).await? {
                continue;
            }

            let attempts = real.mirror_attempts + 1;
            match self.mirror(&real).await {
                Ok(position) => {
                    self.store
                        .finish_real_mirroring(real.id, RealStatus::Mirrored, attempts)
                        .await?;
                    summary.mirrored += 1;
                    tracing::info!(
                        real_id = %real.id,
                        position_id = %position.id,
                        symbol = %position.symbol,
                        volume = position.volume,
                        leverage = position.leverage,
                        entry_price = position.entry_price,
                        "Mirrored position to exchange"
                    );
                }
                Err(MirrorFailure::Retryable(e)) => {
                    let status = if attempts >= self.config.max_mirror_attempts {
                        summary.rejected += 1;
                        RealStatus::Rejected
                    } else {
                        summary.failed += 1;
                        RealStatus::Validated
                    };
                    self.store
                        .finish_real_mirroring(real.id, status, attempts)
                        .await?;
                    tracing::error!(
                        real_id = %real.id,
                        symbol = %real.symbol,
                        attempts,
                        status = %status,
                        error = %e,
                        "Mirroring failed"
                    );
                }
                Err(MirrorFailure::Unsynced {
                    error,
                    exchange_order_id,
                }) => {
                    summary.out_of_sync += 1;
                    self.store
                        .finish_real_mirroring(real.id, RealStatus::OutOfSync, attempts)
                        .await?;
                    tracing::error!(
                        real_id = %real.id,
                        symbol = %real.symbol,
                        exchange_order_id = exchange_order_id.as_deref().unwrap_or("unknown"),
                        error = %error,
                        "Exchange order without a local position; needs reconciliation"
                    );
                }
            }
        }

        Ok(summary)
    }

    async fn mirror(&self, real: &RealPseudoPosition) -> std::result::Result<ExchangePosition, MirrorFailure> {
        let connector = self.executor.connector().clone();
        let limiter = self.executor.limiter().clone();

        let balance = limiter
            .execute(|| connector.get_balance())
            .await
            .map_err(MirrorFailure::Retryable)?;
        let price = limiter
            .execute(|| connector.ticker_price(&real.symbol))
            .await
            .map_err(MirrorFailure::Retryable)?;
        let size = size_position(balance.total_balance, price, &self.sizing).ok_or_else(|| {
            MirrorFailure::Retryable(EngineError::InvalidState(format!(
                "balance {:.2} too small to size {} at {}",
                balance.total_balance, real.symbol, price
            )))
        })?;

        let order = self
            .executor
            .execute_order(OrderRequest {
                connection_id: real.connection_id.clone(),
                symbol: real.symbol.clone(),
                side: OrderSide::opening(real.direction),
                order_type: OrderType::Market,
                quantity: size.volume,
                price: None,
                leverage: size.leverage,
                reduce_only: false,
            })
            .await
            .map_err(|e| match e {
                EngineError::ExchangeRejection { .. } | EngineError::DuplicateOrder(_) => {
                    MirrorFailure::Retryable(e)
                }
                error => MirrorFailure::Unsynced {
                    error,
                    exchange_order_id: None,
                },
            })?;

        let entry = order.avg_price.unwrap_or(price);
        let sign = real.direction.sign();
        let position = ExchangePosition {
            id: Uuid::new_v4(),
            real_id: real.id,
            connection_id: real.connection_id.clone(),
            exchange: self.executor.exchange().to_string(),
            symbol: real.symbol.clone(),
            direction: real.direction,
            exchange_order_id: order.exchange_order_id.clone(),
            entry_price: entry,
            volume: order.filled_quantity.unwrap_or(size.volume),
            leverage: size.leverage,
            take_profit_price: entry * (1.0 + sign * real.take_profit_pct / 100.0),
            stop_loss_price: entry * (1.0 - sign * real.stop_loss_pct / 100.0),
            trailing_enabled: real.trailing_enabled,
            trail_start: real.trail_start,
            trail_stop: real.trail_stop,
            trailing_active: false,
            best_price: entry,
            current_price: entry,
            unrealized_pnl: 0.0,
            max_profit_pct: 0.0,
            max_loss_pct: 0.0,
            status: ExchangePositionStatus::Open,
            sync_status: SyncStatus::Synced,
            close_reason: None,
            close_order_id: None,
            realized_pnl: None,
            opened_at: Utc::now(),
            closed_at: None,
        };
        self.store
            .insert_exchange_position(&position)
            .await
            .map_err(|error| MirrorFailure::Unsynced {
                error,
                exchange_order_id: order.exchange_order_id.clone(),
            })?;
        Ok(position)
    }

    /// Mark the open exchange positions of a symbol and close those whose
    /// exit triggered. A failed close leaves the position open with
    /// `close_failed` sync status; it is retried on the next tick.
    pub async fn mark_exchange_positions(
        &self,
        connection_id: &str,
        symbol: &str,
        price: f64,
    ) -> Result<MarkSummary> {
        let mut summary = MarkSummary::default();
        let positions = self
            .store
            .open_exchange_positions(connection_id, symbol)
            .await?;

        for mut position in positions {
            summary.marked += 1;
            if let Some(reason) = mark_exchange_position(&mut position, price) {
                if self.close_exchange_position(&mut position, reason, price).await {
                    summary.closed += 1;
                }
            }
            self.store.update_exchange_position(&position).await?;
        }

        Ok(summary)
    }

    async fn close_exchange_position(
        &self,
        position: &mut ExchangePosition,
        reason: CloseReason,
        price: f64,
    ) -> bool {
        let request = OrderRequest {
            connection_id: position.connection_id.clone(),
            symbol: position.symbol.clone(),
            side: OrderSide::closing(position.direction),
            order_type: OrderType::Market,
            quantity: position.volume,
            price: None,
            leverage: position.leverage,
            reduce_only: true,
        };

        match self.executor.execute_order(request).await {
            Ok(order) => {
                let exit = order.avg_price.unwrap_or(price);
                position.status = ExchangePositionStatus::Closed;
                position.sync_status = SyncStatus::Synced;
                position.close_reason = Some(reason);
                position.close_order_id = order.exchange_order_id;
                position.realized_pnl = Some(position.pnl_at(exit));
                position.current_price = exit;
                position.closed_at = Some(Utc::now());

                tracing::info!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    reason = %reason,
                    realized_pnl = position.realized_pnl.unwrap_or(0.0),
                    "Closed exchange position"
                );
                true
            }
            Err(e) => {
                position.sync_status = SyncStatus::CloseFailed;
                tracing::error!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    reason = %reason,
                    error = %e,
                    "Failed to close exchange position"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ExecutorConfig, IndicationConfig, PaperConfig, PoolConfig, RateLimitConfig,
    };
    use crate::db::MemoryStore;
    use crate::execution::{PaperConnector, RateLimiter};
    use crate::models::{sample_key, sample_real, BasePositionAggregate};
    use crate::positions::close_trial;
    use chrono::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        paper: Arc<PaperConnector>,
        coordinator: GraduationCoordinator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let paper = Arc::new(PaperConnector::new(
            "paper",
            PaperConfig {
                volatility_bps: 0.0,
                slippage_bps: 0.0,
                ..PaperConfig::default()
            },
            1,
        ));
        paper.set_price("BTCUSDT", 100.0);
        let limiter = Arc::new(RateLimiter::new("paper", RateLimitConfig::default()));
        let executor = Arc::new(OrderExecutor::new(
            store.clone(),
            paper.clone(),
            limiter,
            ExecutorConfig {
                retry_delay_ms: 1,
                ..ExecutorConfig::default()
            },
        ));
        let pool = Arc::new(PoolManager::new(
            store.clone(),
            PoolConfig::default(),
            &IndicationConfig::default(),
        ));
        let coordinator = GraduationCoordinator::new(
            store.clone(),
            pool,
            executor,
            GraduationConfig::default(),
            SizingConfig::default(),
        );
        Fixture {
            store,
            paper,
            coordinator,
        }
    }

    fn closed_trial(
        level: TrialLevel,
        aggregate_id: Uuid,
        close_price: f64,
        opened: DateTime<Utc>,
        hours: i64,
    ) -> PseudoPositionTrial {
        let mut trial =
            PseudoPositionTrial::open(level, Some(aggregate_id), sample_key("c", "BTCUSDT"), 100.0, opened);
        let reason = if close_price > 100.0 {
            CloseReason::TakeProfit
        } else {
            CloseReason::StopLoss
        };
        close_trial(&mut trial, close_price, reason, opened + Duration::hours(hours));
        trial
    }

    async fn seeded_aggregate(store: &MemoryStore) -> BasePositionAggregate {
        store
            .get_or_create_aggregate(&sample_key("c", "BTCUSDT"), 250)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_base_close_promotes_main_once() {
        let f = fixture();
        let aggregate = seeded_aggregate(&f.store).await;
        let now = Utc::now();

        // Nine winning closes: not enough history yet
        for _ in 0..9 {
            let trial = closed_trial(TrialLevel::Base, aggregate.id, 101.0, now, 1);
            assert_eq!(f.coordinator.on_trial_closed(&trial, now).await.unwrap(), Promotion::None);
        }

        let tenth = closed_trial(TrialLevel::Base, aggregate.id, 101.0, now, 1);
        let promotion = f.coordinator.on_trial_closed(&tenth, now).await.unwrap();
        assert!(matches!(promotion, Promotion::Main(_)));

        let eleventh = closed_trial(TrialLevel::Base, aggregate.id, 101.0, now, 1);
        assert_eq!(f.coordinator.on_trial_closed(&eleventh, now).await.unwrap(), Promotion::None);

        let mains: Vec<_> = f
            .store
            .trials()
            .into_iter()
            .filter(|t| t.level == TrialLevel::Main)
            .collect();
        assert_eq!(mains.len(), 1);
        assert_eq!(mains[0].entry_price, 101.0);
    }

    #[tokio::test]
    async fn test_main_close_validates_real_position() {
        let f = fixture();
        let aggregate = seeded_aggregate(&f.store).await;
        let start = Utc::now() - Duration::days(5);

        // Nine closed mains already on record, 6 wins, losses open 2h each
        for i in 0..9 {
            let price = if i % 3 == 0 { 99.5 } else { 101.0 };
            f.store
                .seed_trial(closed_trial(TrialLevel::Main, aggregate.id, price, start + Duration::hours(i), 2));
        }
        let last = closed_trial(TrialLevel::Main, aggregate.id, 101.0, start + Duration::hours(20), 1);
        f.store.seed_trial(last.clone());

        let promotion = f.coordinator.on_trial_closed(&last, Utc::now()).await.unwrap();
        let Promotion::Real(real_id) = promotion else {
            panic!("expected a real position, got {:?}", promotion);
        };

        let reals = f.store.real_positions();
        assert_eq!(reals.len(), 1);
        assert_eq!(reals[0].id, real_id);
        assert_eq!(reals[0].status, RealStatus::Validated);
        assert_eq!(reals[0].reference_price, 101.0);
        assert!((reals[0].avg_drawdown_hours - 2.0).abs() < 1e-9);

        // Same main trial again: one real position per main
        assert_eq!(f.coordinator.on_trial_closed(&last, Utc::now()).await.unwrap(), Promotion::None);
    }

    #[tokio::test]
    async fn test_long_losing_drawdowns_block_real() {
        let f = fixture();
        let aggregate = seeded_aggregate(&f.store).await;
        let start = Utc::now() - Duration::days(5);

        for i in 0..10 {
            let price = if i % 2 == 0 { 99.5 } else { 101.5 };
            f.store
                .seed_trial(closed_trial(TrialLevel::Main, aggregate.id, price, start + Duration::hours(i), 20));
        }
        let last = closed_trial(TrialLevel::Main, aggregate.id, 101.5, start + Duration::hours(30), 1);
        f.store.seed_trial(last.clone());

        assert_eq!(f.coordinator.on_trial_closed(&last, Utc::now()).await.unwrap(), Promotion::None);
        assert!(f.store.real_positions().is_empty());
    }

    fn validated_real(aggregate_id: Uuid) -> RealPseudoPosition {
        sample_real("c", aggregate_id)
    }

    #[tokio::test]
    async fn test_mirror_sweep_opens_and_closes_exchange_position() {
        let f = fixture();
        let aggregate = seeded_aggregate(&f.store).await;
        let now = Utc::now();
        for _ in 0..5 {
            f.store
                .seed_trial(closed_trial(TrialLevel::Base, aggregate.id, 101.0, now, 1));
        }
        let real = validated_real(aggregate.id);
        assert!(f.store.insert_real_position(&real).await.unwrap());

        let summary = f.coordinator.mirror_sweep("c").await.unwrap();
        assert_eq!(summary.mirrored, 1);
        assert_eq!(f.store.real_positions()[0].status, RealStatus::Mirrored);

        let positions = f.store.exchange_positions();
        assert_eq!(positions.len(), 1);
        // 10_000 * 0.02 * 10 / 100
        assert!((positions[0].volume - 20.0).abs() < 1e-9);
        assert_eq!(positions[0].leverage, 10);

        // Nothing left to mirror
        assert_eq!(f.coordinator.mirror_sweep("c").await.unwrap().considered, 0);

        // Price through the take profit closes it with a reduce-only order
        f.paper.set_price("BTCUSDT", 101.5);
        let marked = f
            .coordinator
            .mark_exchange_positions("c", "BTCUSDT", 101.5)
            .await
            .unwrap();
        assert_eq!(marked.closed, 1);

        let closed = &f.store.exchange_positions()[0];
        assert_eq!(closed.status, ExchangePositionStatus::Closed);
        assert_eq!(closed.close_reason, Some(CloseReason::TakeProfit));
        assert!(closed.realized_pnl.unwrap() > 0.0);
        assert!(f.store.orders().iter().any(|o| o.reduce_only));
    }

    #[tokio::test]
    async fn test_mirror_deferred_on_weak_history() {
        let f = fixture();
        let aggregate = seeded_aggregate(&f.store).await;
        let now = Utc::now();
        for _ in 0..5 {
            f.store
                .seed_trial(closed_trial(TrialLevel::Base, aggregate.id, 99.0, now, 1));
        }
        let real = validated_real(aggregate.id);
        f.store.insert_real_position(&real).await.unwrap();

        let summary = f.coordinator.mirror_sweep("c").await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.mirrored, 0);
        // Not discarded
        assert_eq!(f.store.real_positions()[0].status, RealStatus::Validated);
        assert!(f.store.exchange_positions().is_empty());
    }

    #[tokio::test]
    async fn test_deferred_positions_do_not_starve_newer_ones() {
        let f = fixture();
        let aggregate = seeded_aggregate(&f.store).await;
        let now = Utc::now();
        for _ in 0..5 {
            f.store
                .seed_trial(closed_trial(TrialLevel::Base, aggregate.id, 101.0, now, 1));
        }

        // A full batch of older positions whose aggregates have no history
        for i in 0..10 {
            let mut stale = validated_real(Uuid::new_v4());
            stale.created_at = now - Duration::hours(2) + Duration::minutes(i);
            stale.updated_at = stale.created_at;
            assert!(f.store.insert_real_position(&stale).await.unwrap());
        }
        let mut fresh = validated_real(aggregate.id);
        fresh.created_at = now - Duration::minutes(10);
        fresh.updated_at = fresh.created_at;
        assert!(f.store.insert_real_position(&fresh).await.unwrap());

        let first = f.coordinator.mirror_sweep("c").await.unwrap();
        assert_eq!(first.considered, 10);
        assert_eq!(first.skipped, 10);
        assert_eq!(first.mirrored, 0);

        let second = f.coordinator.mirror_sweep("c").await.unwrap();
        assert_eq!(second.mirrored, 1);

        let mirrored: Vec<_> = f
            .store
            .real_positions()
            .into_iter()
            .filter(|r| r.status == RealStatus::Mirrored)
            .collect();
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[0].id, fresh.id);
    }

    #[tokio::test]
    async fn test_fill_without_local_position_is_never_reordered() {
        let f = fixture();
        let aggregate = seeded_aggregate(&f.store).await;
        let now = Utc::now();
        for _ in 0..5 {
            f.store
                .seed_trial(closed_trial(TrialLevel::Base, aggregate.id, 101.0, now, 1));
        }
        let real = validated_real(aggregate.id);
        f.store.insert_real_position(&real).await.unwrap();
        f.store.refuse_exchange_positions(true);

        let summary = f.coordinator.mirror_sweep("c").await.unwrap();
        assert_eq!(summary.out_of_sync, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(f.store.real_positions()[0].status, RealStatus::OutOfSync);
        assert!(f.store.exchange_positions().is_empty());

        // The filled order is not placed a second time
        f.store.refuse_exchange_positions(false);
        let again = f.coordinator.mirror_sweep("c").await.unwrap();
        assert_eq!(again.considered, 0);
        let orders = f.store.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, crate::models::OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_close_against_missing_aggregate_keeps_marking() {
        let f = fixture();
        let now = Utc::now();
        let aggregate = seeded_aggregate(&f.store).await;
        let orphan = PseudoPositionTrial::open(
            TrialLevel::Base,
            Some(Uuid::new_v4()),
            sample_key("c", "BTCUSDT"),
            100.0,
            now,
        );
        f.store.seed_trial(orphan);
        let owned = PseudoPositionTrial::open(
            TrialLevel::Base,
            Some(aggregate.id),
            sample_key("c", "BTCUSDT"),
            100.0,
            now,
        );
        f.store.seed_trial(owned);

        let marks = f
            .coordinator
            .mark_trials("c", "BTCUSDT", &[TrialLevel::Base], 101.05, now)
            .await
            .unwrap();
        assert_eq!(marks.closed, 2);

        let updated = f.store.get_aggregate(aggregate.id).await.unwrap().unwrap();
        assert_eq!(updated.total_positions, 1);
        assert!(f
            .store
            .trials()
            .iter()
            .all(|t| t.status == crate::models::TrialStatus::Closed));
    }

    #[tokio::test]
    async fn test_mark_trials_closes_and_records() {
        let f = fixture();
        let pool_key = sample_key("c", "BTCUSDT");
        let aggregate = seeded_aggregate(&f.store).await;
        let trial = PseudoPositionTrial::open(TrialLevel::Base, Some(aggregate.id), pool_key, 100.0, Utc::now());
        f.store.seed_trial(trial);

        let first = f
            .coordinator
            .mark_trials("c", "BTCUSDT", &[TrialLevel::Base], 100.2, Utc::now())
            .await
            .unwrap();
        assert_eq!(first.marked, 1);
        assert_eq!(first.closed, 0);

        let second = f
            .coordinator
            .mark_trials("c", "BTCUSDT", &[TrialLevel::Base], 101.05, Utc::now())
            .await
            .unwrap();
        assert_eq!(second.closed, 1);

        let updated = f.store.get_aggregate(aggregate.id).await.unwrap().unwrap();
        assert_eq!(updated.total_positions, 1);
        assert_eq!(updated.winning_positions, 1);
    }
}
