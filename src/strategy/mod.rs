// Preset strategies: standard technical-indicator signals traded as
// preset-level pseudo positions
pub mod ema_cross;
pub mod rsi_reversion;

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::{IndicationConfig, PresetConfig};
use crate::db::{Store, TrialInsert};
use crate::models::{ConfigKey, Direction, IndicationType, PriceTick, PseudoPositionTrial, TrialLevel};
use crate::Result;

pub use ema_cross::EmaCrossStrategy;
pub use rsi_reversion::RsiReversionStrategy;

/// Base trait for preset strategies
pub trait PresetStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Value recorded as the range of the strategy's ConfigKey
    fn parameter(&self) -> f64;

    /// Minimum samples required before the strategy can signal
    fn min_samples_required(&self) -> usize;

    /// Direction to open, if the strategy signals on this series (oldest first)
    fn evaluate(&self, prices: &[f64]) -> Option<Direction>;
}

/// Runs every preset strategy on a symbol and opens preset trials for the
/// ones that signal, subject to the configuration slot limit
pub struct PresetEvaluator {
    store: Arc<dyn Store>,
    strategies: Vec<Box<dyn PresetStrategy>>,
    config: PresetConfig,
    slot_limit: u32,
}

impl PresetEvaluator {
    pub fn new(store: Arc<dyn Store>, config: PresetConfig, indication: &IndicationConfig) -> Self {
        let strategies: Vec<Box<dyn PresetStrategy>> = vec![
            Box::new(RsiReversionStrategy::new(
                config.rsi_period,
                config.rsi_oversold,
                config.rsi_overbought,
            )),
            Box::new(EmaCrossStrategy::new(config.ema_fast, config.ema_slow)),
        ];
        Self {
            store,
            strategies,
            config,
            slot_limit: indication.max_positions_per_config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn preset_key(&self, connection_id: &str, symbol: &str, strategy: &dyn PresetStrategy, direction: Direction) -> ConfigKey {
        ConfigKey {
            connection_id: connection_id.to_string(),
            symbol: symbol.to_string(),
            indication_type: IndicationType::Preset,
            range_or_threshold: strategy.parameter(),
            direction,
            take_profit_factor: self.config.take_profit_factor,
            stop_loss_ratio: self.config.stop_loss_ratio,
            trailing_enabled: false,
            trail_start: None,
            trail_stop: None,
            drawdown_ratio: None,
            market_change_range: None,
            last_part_ratio: None,
        }
    }

    /// Evaluate all strategies; returns the number of trials opened
    pub async fn evaluate_symbol(
        &self,
        connection_id: &str,
        symbol: &str,
        ticks: &[PriceTick],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if !self.config.enabled {
            return Ok(0);
        }
        let Some(latest) = ticks.last() else {
            return Ok(0);
        };
        let prices: Vec<f64> = ticks.iter().map(|t| t.price).collect();

        let mut opened = 0;
        for strategy in &self.strategies {
            if prices.len() < strategy.min_samples_required() {
                continue;
            }
            let Some(direction) = strategy.evaluate(&prices) else {
                continue;
            };

            let key = self.preset_key(connection_id, symbol, strategy.as_ref(), direction);
            let trial = PseudoPositionTrial::open(TrialLevel::Preset, None, key, latest.price, now);
            match self.store.insert_trial(&trial, self.slot_limit, None).await? {
                TrialInsert::Inserted => {
                    opened += 1;
                    tracing::debug!(
                        strategy = strategy.name(),
                        symbol = %symbol,
                        direction = %direction,
                        entry_price = latest.price,
                        "Opened preset trial"
                    );
                }
                TrialInsert::SlotFull | TrialInsert::CapacityReached => {}
            }
        }

        Ok(opened)
    }
}
