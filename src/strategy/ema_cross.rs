use crate::indicators::ema_series;
use crate::models::Direction;
use crate::strategy::PresetStrategy;

/// Fast/slow EMA crossover
///
/// Fires only on the sample where the fast EMA crosses the slow one:
/// upward cross goes long, downward cross goes short.
#[derive(Debug, Clone)]
pub struct EmaCrossStrategy {
    fast: usize,
    slow: usize,
}

impl EmaCrossStrategy {
    pub fn new(fast: usize, slow: usize) -> Self {
        Self { fast, slow }
    }
}

impl Default for EmaCrossStrategy {
    fn default() -> Self {
        Self::new(9, 21)
    }
}

impl PresetStrategy for EmaCrossStrategy {
    fn name(&self) -> &str {
        "ema_cross"
    }

    fn parameter(&self) -> f64 {
        self.slow as f64
    }

    fn min_samples_required(&self) -> usize {
        self.slow.max(self.fast) + 1
    }

    fn evaluate(&self, prices: &[f64]) -> Option<Direction> {
        if self.fast >= self.slow || prices.len() < self.min_samples_required() {
            return None;
        }

        let fast = ema_series(prices, self.fast);
        let slow = ema_series(prices, self.slow);
        // Both series end at the latest price; align on their tails
        let (f_now, f_prev) = (fast[fast.len() - 1], fast[fast.len() - 2]);
        let (s_now, s_prev) = (slow[slow.len() - 1], slow[slow.len() - 2]);

        if f_prev <= s_prev && f_now > s_now {
            Some(Direction::Long)
        } else if f_prev >= s_prev && f_now < s_now {
            Some(Direction::Short)
        } else {
            None
        }
    }
}
