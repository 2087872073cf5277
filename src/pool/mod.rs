//! Base position pool: one aggregate per configuration and the statistical
//! gates that decide whether that configuration keeps trading.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{IndicationConfig, PoolConfig};
use crate::db::{Store, TrialInsert};
use crate::models::{BasePositionAggregate, ConfigKey, Phase, PseudoPositionTrial, TrialLevel};
use crate::{EngineError, Result};

/// Outcome of asking the pool to open a base trial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialGate {
    Opened,
    /// The aggregate's phase does not allow new trials
    PhaseBlocked,
    /// The aggregate opened a trial less than `position_cooldown_ms` ago
    Cooldown,
    /// The configuration slot already holds `max_positions_per_config` trials
    SlotFull,
    /// The aggregate owns `capacity` trial rows
    CapacityReached,
}

/// Phase change produced by a recorded close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseChange {
    pub from: Phase,
    pub to: Phase,
}

/// Whether an aggregate may open another trial, from its phase and stats
pub fn can_create_trial(aggregate: &BasePositionAggregate, config: &PoolConfig) -> bool {
    match aggregate.phase {
        Phase::Failed => false,
        Phase::Paused => aggregate.win_rate >= config.resume_win_rate,
        Phase::Evaluating => {
            aggregate.total_positions < config.failure_checkpoint
                || (aggregate.total_positions < config.promotion_checkpoint
                    && aggregate.win_rate >= config.min_win_rate)
        }
        Phase::Active => true,
    }
}

/// Fold one closed trial into the aggregate's running statistics and apply
/// the phase rules:
/// - at exactly `failure_checkpoint` closes, a win rate under `min_win_rate`
///   fails the aggregate for good
/// - at `promotion_checkpoint` closes it becomes `active` when both win rate
///   and profit ratio clear their thresholds, `paused` otherwise
/// - past `promotion_checkpoint`, a weak win rate or a deep recent drawdown
///   pauses an active aggregate, and a recovered paused one resumes
///
/// `max_drawdown` is the all-time worst close. The pause and resume checks
/// read `recent_drawdown` instead, which decays by `drawdown_decay` per close.
pub fn apply_close(
    aggregate: &mut BasePositionAggregate,
    pnl: f64,
    is_win: bool,
    drawdown: f64,
    config: &PoolConfig,
) -> Option<PhaseChange> {
    let prior_wins = aggregate.winning_positions as f64;
    let prior_losses = aggregate.losing_positions as f64;

    aggregate.total_positions += 1;
    aggregate.total_profit_loss += pnl;
    if is_win {
        aggregate.winning_positions += 1;
        aggregate.avg_profit = (aggregate.avg_profit * prior_wins + pnl) / (prior_wins + 1.0);
    } else {
        aggregate.losing_positions += 1;
        aggregate.avg_loss = (aggregate.avg_loss * prior_losses + pnl.abs()) / (prior_losses + 1.0);
    }
    aggregate.win_rate = aggregate.winning_positions as f64 / aggregate.total_positions as f64;
    aggregate.max_drawdown = aggregate.max_drawdown.max(drawdown);
    aggregate.recent_drawdown = (aggregate.recent_drawdown * config.drawdown_decay).max(drawdown);
    aggregate.updated_at = Utc::now();

    let from = aggregate.phase;
    let total = aggregate.total_positions;
    let healthy = aggregate.win_rate >= config.activation_win_rate
        && aggregate.profit_ratio() >= config.activation_profit_ratio;

    let to = match from {
        Phase::Failed => Phase::Failed,
        Phase::Evaluating if total == config.failure_checkpoint && aggregate.win_rate < config.min_win_rate => {
            Phase::Failed
        }
        Phase::Evaluating if total >= config.promotion_checkpoint => {
            if healthy {
                Phase::Active
            } else {
                Phase::Paused
            }
        }
        Phase::Active
            if aggregate.win_rate < config.degrade_win_rate
                || aggregate.recent_drawdown > config.max_drawdown_pct =>
        {
            Phase::Paused
        }
        Phase::Paused if healthy && aggregate.recent_drawdown <= config.max_drawdown_pct => {
            Phase::Active
        }
        phase => phase,
    };

    aggregate.phase = to;
    (from != to).then_some(PhaseChange { from, to })
}

/// Owns aggregate lookup, trial admission and close accounting.
pub struct PoolManager {
    store: Arc<dyn Store>,
    config: PoolConfig,
    slot_limit: u32,
    cooldown: chrono::Duration,
}

impl PoolManager {
    pub fn new(store: Arc<dyn Store>, config: PoolConfig, indication: &IndicationConfig) -> Self {
        Self {
            store,
            config,
            slot_limit: indication.max_positions_per_config,
            cooldown: indication.position_cooldown(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The aggregate for `key`; repeated calls return the same row
    pub async fn get_or_create(&self, key: &ConfigKey) -> Result<BasePositionAggregate> {
        self.store
            .get_or_create_aggregate(key, self.config.capacity)
            .await
    }

    pub async fn can_create(&self, aggregate_id: Uuid) -> Result<bool> {
        let aggregate = self
            .store
            .get_aggregate(aggregate_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("aggregate {}", aggregate_id)))?;
        Ok(can_create_trial(&aggregate, &self.config))
    }

    /// Open a base trial for `key` at `entry_price`, subject to the phase
    /// gate, the position cooldown, the slot limit and the aggregate's
    /// capacity.
    pub async fn open_base_trial(
        &self,
        key: &ConfigKey,
        entry_price: f64,
        now: DateTime<Utc>,
    ) -> Result<TrialGate> {
        let aggregate = self.get_or_create(key).await?;

        if !can_create_trial(&aggregate, &self.config) {
            return Ok(TrialGate::PhaseBlocked);
        }

        if self.cooldown > chrono::Duration::zero() {
            if let Some(last) = aggregate.last_trial_at {
                if now - last < self.cooldown {
                    return Ok(TrialGate::Cooldown);
                }
            }
        }

        let trial = PseudoPositionTrial::open(
            TrialLevel::Base,
            Some(aggregate.id),
            key.clone(),
            entry_price,
            now,
        );

        let gate = match self
            .store
            .insert_trial(&trial, self.slot_limit, Some(aggregate.capacity))
            .await?
        {
            TrialInsert::Inserted => TrialGate::Opened,
            TrialInsert::SlotFull => TrialGate::SlotFull,
            TrialInsert::CapacityReached => TrialGate::CapacityReached,
        };

        if gate == TrialGate::Opened {
            tracing::debug!(
                aggregate_id = %aggregate.id,
                trial_id = %trial.id,
                symbol = %key.symbol,
                direction = %key.direction,
                entry_price,
                "Opened base trial"
            );
        }
        Ok(gate)
    }

    /// Record a closed trial against its aggregate and persist the result.
    ///
    /// Returns `None` when the aggregate row no longer exists; the close is
    /// dropped with a warning.
    pub async fn record_close(
        &self,
        aggregate_id: Uuid,
        pnl: f64,
        is_win: bool,
        drawdown: f64,
    ) -> Result<Option<BasePositionAggregate>> {
        let Some(mut aggregate) = self.store.get_aggregate(aggregate_id).await? else {
            tracing::warn!(
                aggregate_id = %aggregate_id,
                pnl,
                "Closed trial references a missing aggregate"
            );
            return Ok(None);
        };

        let change = apply_close(&mut aggregate, pnl, is_win, drawdown, &self.config);
        self.store.update_aggregate(&aggregate).await?;

        if let Some(change) = change {
            tracing::info!(
                aggregate_id = %aggregate.id,
                symbol = %aggregate.key.symbol,
                indication = %aggregate.key.indication_type,
                from = %change.from,
                to = %change.to,
                total = aggregate.total_positions,
                win_rate = aggregate.win_rate,
                "Aggregate phase changed"
            );
        }

        Ok(Some(aggregate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::sample_key;

    fn close_n(aggregate: &mut BasePositionAggregate, wins: u32, losses: u32, win: f64, loss: f64) {
        let config = PoolConfig::default();
        for _ in 0..wins {
            apply_close(aggregate, win, true, 1.0, &config);
        }
        for _ in 0..losses {
            apply_close(aggregate, -loss, false, 2.0, &config);
        }
    }

    #[test]
    fn test_ten_closes_with_three_wins_fail() {
        let mut aggregate = BasePositionAggregate::new(sample_key("c", "BTCUSDT"), 250);
        close_n(&mut aggregate, 3, 7, 1.0, 1.0);

        assert_eq!(aggregate.total_positions, 10);
        assert!((aggregate.win_rate - 0.3).abs() < 1e-9);
        assert_eq!(aggregate.phase, Phase::Failed);
    }

    #[test]
    fn test_failed_is_terminal() {
        let config = PoolConfig::default();
        let mut aggregate = BasePositionAggregate::new(sample_key("c", "BTCUSDT"), 250);
        close_n(&mut aggregate, 3, 7, 1.0, 1.0);
        assert!(!can_create_trial(&aggregate, &config));

        // Even a long winning streak does not revive it
        for _ in 0..100 {
            apply_close(&mut aggregate, 5.0, true, 0.0, &config);
            assert_eq!(aggregate.phase, Phase::Failed);
            assert!(!can_create_trial(&aggregate, &config));
        }
    }

    #[test]
    fn test_fifty_closes_promote_to_active() {
        let mut aggregate = BasePositionAggregate::new(sample_key("c", "BTCUSDT"), 250);
        // Alternate so the 10-close checkpoint sees a 50% win rate
        for _ in 0..25 {
            close_n(&mut aggregate, 1, 1, 12.0, 8.0);
        }

        assert_eq!(aggregate.total_positions, 50);
        assert!((aggregate.win_rate - 0.5).abs() < 1e-9);
        assert!((aggregate.avg_profit - 12.0).abs() < 1e-9);
        assert!((aggregate.avg_loss - 8.0).abs() < 1e-9);
        assert!((aggregate.profit_ratio() - 1.5).abs() < 1e-9);
        assert_eq!(aggregate.phase, Phase::Active);
    }

    #[test]
    fn test_fifty_closes_with_weak_ratio_pause() {
        let mut aggregate = BasePositionAggregate::new(sample_key("c", "BTCUSDT"), 250);
        for _ in 0..25 {
            close_n(&mut aggregate, 1, 1, 8.0, 8.0);
        }
        assert_eq!(aggregate.phase, Phase::Paused);
        // 50% win rate is above the resume threshold
        assert!(can_create_trial(&aggregate, &PoolConfig::default()));
    }

    #[test]
    fn test_active_degrades_on_drawdown_and_recovers() {
        let config = PoolConfig::default();
        let mut aggregate = BasePositionAggregate::new(sample_key("c", "BTCUSDT"), 250);
        for _ in 0..25 {
            close_n(&mut aggregate, 1, 1, 12.0, 8.0);
        }
        assert_eq!(aggregate.phase, Phase::Active);

        let change = apply_close(&mut aggregate, -8.0, false, 35.0, &config);
        assert_eq!(change, Some(PhaseChange { from: Phase::Active, to: Phase::Paused }));

        // 35 * 0.9 is still above the 30% cap
        apply_close(&mut aggregate, 12.0, true, 0.0, &config);
        assert_eq!(aggregate.phase, Phase::Paused);

        // One more quiet close decays it under the cap and the aggregate resumes
        let change = apply_close(&mut aggregate, 12.0, true, 0.0, &config);
        assert_eq!(change, Some(PhaseChange { from: Phase::Paused, to: Phase::Active }));
        assert!(aggregate.recent_drawdown < config.max_drawdown_pct);
        assert_eq!(aggregate.max_drawdown, 35.0);
    }

    #[test]
    fn test_evaluating_gate() {
        let config = PoolConfig::default();
        let mut aggregate = BasePositionAggregate::new(sample_key("c", "BTCUSDT"), 250);
        assert!(can_create_trial(&aggregate, &config));

        // 12 closes at 1/3 win rate: past the failure checkpoint with a weak rate
        aggregate.total_positions = 12;
        aggregate.win_rate = 1.0 / 3.0;
        assert!(!can_create_trial(&aggregate, &config));

        aggregate.win_rate = 0.5;
        assert!(can_create_trial(&aggregate, &config));
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let pool = PoolManager::new(store.clone(), PoolConfig::default(), &IndicationConfig::default());
        let key = sample_key("c", "BTCUSDT");

        let first = pool.get_or_create(&key).await.unwrap();
        let second = pool.get_or_create(&key.clone()).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.aggregates().len(), 1);
    }

    #[tokio::test]
    async fn test_open_base_trial_gates() {
        let store = Arc::new(MemoryStore::new());
        let indication = IndicationConfig {
            position_cooldown_ms: 60_000,
            ..IndicationConfig::default()
        };
        let pool = PoolManager::new(store.clone(), PoolConfig::default(), &indication);
        let key = sample_key("c", "BTCUSDT");
        let now = Utc::now();

        assert_eq!(pool.open_base_trial(&key, 100.0, now).await.unwrap(), TrialGate::Opened);
        assert_eq!(
            pool.open_base_trial(&key, 100.0, now + chrono::Duration::seconds(1)).await.unwrap(),
            TrialGate::Cooldown
        );
        // Past the cooldown the slot limit of 1 still holds
        assert_eq!(
            pool.open_base_trial(&key, 100.0, now + chrono::Duration::minutes(2)).await.unwrap(),
            TrialGate::SlotFull
        );
        assert_eq!(store.trials().len(), 1);
    }

    #[tokio::test]
    async fn test_record_close_persists_phase() {
        let store = Arc::new(MemoryStore::new());
        let pool = PoolManager::new(store.clone(), PoolConfig::default(), &IndicationConfig::default());
        let aggregate = pool.get_or_create(&sample_key("c", "BTCUSDT")).await.unwrap();

        for i in 0..10 {
            let win = i < 3;
            pool.record_close(aggregate.id, if win { 1.0 } else { -1.0 }, win, 0.5)
                .await
                .unwrap();
        }

        assert!(!pool.can_create(aggregate.id).await.unwrap());
        let key = aggregate.key.clone();
        assert_eq!(
            pool.open_base_trial(&key, 100.0, Utc::now()).await.unwrap(),
            TrialGate::PhaseBlocked
        );
    }

    #[tokio::test]
    async fn test_record_close_on_missing_aggregate_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let pool = PoolManager::new(store.clone(), PoolConfig::default(), &IndicationConfig::default());

        let recorded = pool.record_close(Uuid::new_v4(), 1.0, true, 0.0).await.unwrap();
        assert!(recorded.is_none());
        assert!(store.aggregates().is_empty());
    }
}
