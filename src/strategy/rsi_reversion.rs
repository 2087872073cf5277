use crate::indicators::calculate_rsi;
use crate::models::Direction;
use crate::strategy::PresetStrategy;

/// RSI mean reversion
///
/// Goes long when RSI drops below the oversold level and short when it
/// rises above the overbought level, expecting price to revert.
#[derive(Debug, Clone)]
pub struct RsiReversionStrategy {
    period: usize,
    oversold: f64,
    overbought: f64,
}

impl RsiReversionStrategy {
    pub fn new(period: usize, oversold: f64, overbought: f64) -> Self {
        Self {
            period,
            oversold,
            overbought,
        }
    }
}

impl Default for RsiReversionStrategy {
    fn default() -> Self {
        Self::new(14, 30.0, 70.0)
    }
}

impl PresetStrategy for RsiReversionStrategy {
    fn name(&self) -> &str {
        "rsi_reversion"
    }

    fn parameter(&self) -> f64 {
        self.period as f64
    }

    fn min_samples_required(&self) -> usize {
        self.period + 1
    }

    fn evaluate(&self, prices: &[f64]) -> Option<Direction> {
        let rsi = calculate_rsi(prices, self.period)?;
        if rsi < self.oversold {
            Some(Direction::Long)
        } else if rsi > self.overbought {
            Some(Direction::Short)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oversold_goes_long() {
        let strategy = RsiReversionStrategy::default();
        let falling: Vec<f64> = (0..20).map(|i| 100.0 - i as f64 * 0.5).collect();
        assert_eq!(strategy.evaluate(&falling), Some(Direction::Long));

        let rising: Vec<f64> = (0..20).map(|i| 100.0 + i as f64 * 0.5).collect();
        assert_eq!(strategy.evaluate(&rising), Some(Direction::Short));
    }

    #[test]
    fn test_neutral_and_short_series() {
        let strategy = RsiReversionStrategy::default();
        let choppy: Vec<f64> = (0..20).map(|i| if i % 2 == 0 { 100.0 } else { 101.0 }).collect();
        assert_eq!(strategy.evaluate(&choppy), None);
        assert_eq!(strategy.evaluate(&[100.0, 99.0]), None);
    }
}
