use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;

use super::algorithms::{
    detect_active, detect_active_advanced, detect_direction, detect_move, detect_optimal,
};
use super::{build_config_matrix, state_key, Indication, IndicationParam, OptimalParams};
use crate::config::IndicationConfig;
use crate::db::Store;
use crate::models::{Direction, IndicationType, PriceTick};
use crate::pool::{PoolManager, TrialGate};
use crate::Result;

/// Counters of one detection pass over a symbol
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionSummary {
    pub evaluated: usize,
    pub cooling_down: usize,
    pub fired: usize,
    pub trials_opened: usize,
    /// Configurations refused by a pool gate (phase, cooldown, slot, capacity)
    pub trials_refused: usize,
    pub errors: usize,
}

impl DetectionSummary {
    fn merge(&mut self, other: &DetectionSummary) {
        self.evaluated += other.evaluated;
        self.cooling_down += other.cooling_down;
        self.fired += other.fired;
        self.trials_opened += other.trials_opened;
        self.trials_refused += other.trials_refused;
        self.errors += other.errors;
    }
}

/// Runs every enabled indication parameter over a symbol's price series and
/// seeds the base pool with the configurations of each fired signal.
pub struct IndicationDetector {
    store: Arc<dyn Store>,
    pool: Arc<PoolManager>,
    config: IndicationConfig,
}

impl IndicationDetector {
    pub fn new(store: Arc<dyn Store>, pool: Arc<PoolManager>, config: IndicationConfig) -> Self {
        Self { store, pool, config }
    }

    pub fn config(&self) -> &IndicationConfig {
        &self.config
    }

    /// Every parameter combination of the enabled indication types
    pub fn parameters(&self) -> Vec<IndicationParam> {
        let c = &self.config;
        let mut params = Vec::new();

        if c.is_enabled(IndicationType::Direction) {
            params.extend(c.direction_ranges.iter().map(|&range| IndicationParam::Direction { range }));
        }
        if c.is_enabled(IndicationType::Move) {
            params.extend(c.move_ranges.iter().map(|&range| IndicationParam::Move { range }));
        }
        if c.is_enabled(IndicationType::Active) {
            params.extend(
                c.active_thresholds
                    .iter()
                    .map(|&threshold_pct| IndicationParam::Active { threshold_pct }),
            );
        }
        if c.is_enabled(IndicationType::ActiveAdvanced) {
            for &activity_ratio_pct in &c.activity_ratios {
                for &window_secs in &c.time_windows_secs {
                    params.push(IndicationParam::ActiveAdvanced { activity_ratio_pct, window_secs });
                }
            }
        }
        if c.is_enabled(IndicationType::Optimal) {
            for &range in &c.optimal_ranges {
                for &drawdown_ratio in &c.drawdown_ratios {
                    for &market_change_range in &c.market_change_ranges {
                        for &last_part_ratio in &c.last_part_ratios {
                            params.push(IndicationParam::Optimal {
                                range,
                                params: OptimalParams {
                                    drawdown_ratio,
                                    market_change_range,
                                    last_part_ratio,
                                },
                            });
                        }
                    }
                }
            }
        }

        params
    }

    /// Evaluate one parameter combination against a series (oldest first)
    pub fn evaluate(param: &IndicationParam, ticks: &[PriceTick], now: DateTime<Utc>) -> Option<Direction> {
        match *param {
            IndicationParam::Direction { range } => {
                detect_direction(&newest_first(ticks, range as usize), range as usize)
            }
            IndicationParam::Move { range } => {
                let prices: Vec<f64> = ticks.iter().map(|t| t.price).collect();
                detect_move(&prices, range as usize)
            }
            IndicationParam::Active { threshold_pct } => detect_active(ticks, now, threshold_pct),
            IndicationParam::ActiveAdvanced { activity_ratio_pct, window_secs } => {
                detect_active_advanced(ticks, now, activity_ratio_pct, window_secs)
            }
            IndicationParam::Optimal { range, params } => {
                detect_optimal(&newest_first(ticks, range as usize), range as usize, params)
            }
        }
    }

    /// Run all parameters for one symbol in batches of
    /// `parameter_batch_size`; a failing parameter is logged and counted
    /// without affecting its siblings.
    pub async fn detect_symbol(
        &self,
        connection_id: &str,
        symbol: &str,
        ticks: &[PriceTick],
        now: DateTime<Utc>,
    ) -> Result<DetectionSummary> {
        let mut summary = DetectionSummary::default();
        let Some(latest) = ticks.last() else {
            return Ok(summary);
        };

        let params = self.parameters();
        for batch in params.chunks(self.config.parameter_batch_size.max(1)) {
            let results = join_all(
                batch
                    .iter()
                    .map(|param| self.process_param(connection_id, symbol, param, ticks, latest.price, now)),
            )
            .await;

            for (param, result) in batch.iter().zip(results) {
                match result {
                    Ok(part) => summary.merge(&part),
                    Err(e) => {
                        summary.errors += 1;
                        tracing::warn!(
                            connection = %connection_id,
                            symbol = %symbol,
                            param = %param,
                            error = %e,
                            "Indication parameter failed"
                        );
                    }
                }
            }
        }

        if summary.fired > 0 {
            tracing::info!(
                connection = %connection_id,
                symbol = %symbol,
                fired = summary.fired,
                opened = summary.trials_opened,
                refused = summary.trials_refused,
                "Indications fired"
            );
        }

        Ok(summary)
    }

    async fn process_param(
        &self,
        connection_id: &str,
        symbol: &str,
        param: &IndicationParam,
        ticks: &[PriceTick],
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<DetectionSummary> {
        let mut summary = DetectionSummary {
            evaluated: 1,
            ..DetectionSummary::default()
        };

        let key = state_key(connection_id, symbol, param);
        if let Some(validated_at) = self.store.indication_validated_at(&key).await? {
            if now - validated_at < self.config.validation_timeout() {
                summary.cooling_down = 1;
                return Ok(summary);
            }
        }

        let Some(direction) = Self::evaluate(param, ticks, now) else {
            return Ok(summary);
        };
        summary.fired = 1;

        let indication = Indication {
            connection_id: connection_id.to_string(),
            symbol: symbol.to_string(),
            param: *param,
            direction,
            price,
            detected_at: now,
        };

        for config_key in build_config_matrix(&indication, &self.config) {
            match self.pool.open_base_trial(&config_key, price, now).await? {
                TrialGate::Opened => summary.trials_opened += 1,
                _ => summary.trials_refused += 1,
            }
        }

        self.store.stamp_indication(&key, now).await?;

        tracing::debug!(
            state_key = %key,
            direction = %direction,
            price,
            "Indication validated"
        );

        Ok(summary)
    }
}

/// The newest `range + 1` prices, newest first
fn newest_first(ticks: &[PriceTick], range: usize) -> Vec<f64> {
    ticks.iter().rev().take(range + 1).map(|t| t.price).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::db::MemoryStore;
    use chrono::Duration;

    fn detector(store: Arc<MemoryStore>, config: IndicationConfig) -> IndicationDetector {
        let pool = Arc::new(PoolManager::new(store.clone(), PoolConfig::default(), &config));
        IndicationDetector::new(store, pool, config)
    }

    fn direction_only() -> IndicationConfig {
        IndicationConfig {
            enabled_types: vec![IndicationType::Direction],
            direction_ranges: vec![5],
            take_profit_factors: vec![10.0],
            stop_loss_ratios: vec![0.5, 1.0],
            trailing_presets: vec![],
            ..IndicationConfig::default()
        }
    }

    fn falling_series(now: DateTime<Utc>) -> Vec<PriceTick> {
        [105.0, 104.0, 103.0, 102.0, 101.0, 100.0]
            .iter()
            .enumerate()
            .map(|(i, p)| PriceTick::new(*p, now - Duration::seconds(5 - i as i64)))
            .collect()
    }

    #[test]
    fn test_parameter_counts() {
        let store = Arc::new(MemoryStore::new());
        let d = detector(store, IndicationConfig::default());
        let params = d.parameters();

        let advanced = params
            .iter()
            .filter(|p| p.indication_type() == IndicationType::ActiveAdvanced)
            .count();
        assert_eq!(advanced, 48);
        let active = params
            .iter()
            .filter(|p| p.indication_type() == IndicationType::Active)
            .count();
        assert_eq!(active, 5);
        let direction = params
            .iter()
            .filter(|p| p.indication_type() == IndicationType::Direction)
            .count();
        assert_eq!(direction, 28);
    }

    #[test]
    fn test_evaluate_direction_uses_newest_first() {
        let now = Utc::now();
        let ticks = falling_series(now);
        // Chronologically falling: newest-first walk sees rising steps
        assert_eq!(
            IndicationDetector::evaluate(&IndicationParam::Direction { range: 5 }, &ticks, now),
            Some(Direction::Short)
        );
    }

    #[tokio::test]
    async fn test_fired_signal_seeds_pool_and_stamps_gate() {
        let store = Arc::new(MemoryStore::new());
        let d = detector(store.clone(), direction_only());
        let now = Utc::now();
        let ticks = falling_series(now);

        let summary = d.detect_symbol("c", "BTCUSDT", &ticks, now).await.unwrap();
        assert_eq!(summary.evaluated, 1);
        assert_eq!(summary.fired, 1);
        assert_eq!(summary.trials_opened, 2);
        assert_eq!(store.aggregates().len(), 2);
        assert!(store.trials().iter().all(|t| t.entry_price == 100.0));

        // Same tick again: cooldown gate holds
        let again = d.detect_symbol("c", "BTCUSDT", &ticks, now + Duration::seconds(1)).await.unwrap();
        assert_eq!(again.cooling_down, 1);
        assert_eq!(again.fired, 0);

        // After the validation timeout the signal fires, but the slots are taken
        let later = d.detect_symbol("c", "BTCUSDT", &ticks, now + Duration::seconds(16)).await.unwrap();
        assert_eq!(later.fired, 1);
        assert_eq!(later.trials_opened, 0);
        assert_eq!(later.trials_refused, 2);
        assert_eq!(store.trials().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_series_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let d = detector(store.clone(), direction_only());
        let summary = d.detect_symbol("c", "BTCUSDT", &[], Utc::now()).await.unwrap();
        assert_eq!(summary, DetectionSummary::default());
    }
}
