use chrono::Utc;
use std::collections::VecDeque;
use std::time::Duration;

use crate::models::{LoopHealth, LoopStats};

pub const HEALTHY_SUCCESS_RATE: f64 = 0.95;
pub const UNHEALTHY_SUCCESS_RATE: f64 = 0.70;
/// Cycle duration over interval at or below which a loop keeps up
pub const HEALTHY_DURATION_RATIO: f64 = 1.5;
pub const UNHEALTHY_DURATION_RATIO: f64 = 3.0;

/// Classify a loop from its symbol success rate and how long its cycles
/// take relative to the configured interval
pub fn classify_health(success_rate: f64, duration_ratio: f64) -> LoopHealth {
    if success_rate < UNHEALTHY_SUCCESS_RATE || duration_ratio > UNHEALTHY_DURATION_RATIO {
        LoopHealth::Unhealthy
    } else if success_rate >= HEALTHY_SUCCESS_RATE && duration_ratio <= HEALTHY_DURATION_RATIO {
        LoopHealth::Healthy
    } else {
        LoopHealth::Degraded
    }
}

struct CycleSample {
    duration_ms: u64,
    symbols: usize,
    succeeded: usize,
}

/// Rolling per-loop cycle statistics
pub struct LoopMetrics {
    interval: Duration,
    window: usize,
    cycle_count: u64,
    samples: VecDeque<CycleSample>,
}

impl LoopMetrics {
    pub fn new(interval: Duration, window: usize) -> Self {
        Self {
            interval,
            window: window.max(1),
            cycle_count: 0,
            samples: VecDeque::new(),
        }
    }

    /// Fold in one finished cycle and return the updated snapshot
    pub fn record(&mut self, duration: Duration, symbols: usize, succeeded: usize) -> LoopStats {
        self.cycle_count += 1;
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(CycleSample {
            duration_ms: duration.as_millis() as u64,
            symbols,
            succeeded,
        });
        self.snapshot()
    }

    pub fn snapshot(&self) -> LoopStats {
        let n = self.samples.len().max(1) as f64;
        let avg_cycle_ms = self.samples.iter().map(|s| s.duration_ms as f64).sum::<f64>() / n;

        let attempted: usize = self.samples.iter().map(|s| s.symbols).sum();
        let succeeded: usize = self.samples.iter().map(|s| s.succeeded).sum();
        let success_rate = if attempted == 0 {
            1.0
        } else {
            succeeded as f64 / attempted as f64
        };

        let interval_ms = self.interval.as_millis().max(1) as f64;
        let last = self.samples.back();

        LoopStats {
            cycle_count: self.cycle_count,
            last_cycle_ms: last.map(|s| s.duration_ms).unwrap_or(0),
            avg_cycle_ms,
            symbol_count: last.map(|s| s.symbols).unwrap_or(0),
            success_rate,
            health: classify_health(success_rate, avg_cycle_ms / interval_ms),
            last_cycle_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_bands() {
        assert_eq!(classify_health(1.0, 0.5), LoopHealth::Healthy);
        assert_eq!(classify_health(0.95, 1.5), LoopHealth::Healthy);
        assert_eq!(classify_health(0.9, 1.0), LoopHealth::Degraded);
        assert_eq!(classify_health(1.0, 2.0), LoopHealth::Degraded);
        assert_eq!(classify_health(0.6, 1.0), LoopHealth::Unhealthy);
        assert_eq!(classify_health(1.0, 3.5), LoopHealth::Unhealthy);
    }

    #[test]
    fn test_rolling_window() {
        let mut metrics = LoopMetrics::new(Duration::from_millis(100), 3);
        metrics.record(Duration::from_millis(1000), 4, 0);
        for _ in 0..3 {
            metrics.record(Duration::from_millis(50), 4, 4);
        }
        let stats = metrics.snapshot();

        // The slow, failing first cycle has rolled out of the window
        assert_eq!(stats.cycle_count, 4);
        assert_eq!(stats.avg_cycle_ms, 50.0);
        assert_eq!(stats.success_rate, 1.0);
        assert_eq!(stats.health, LoopHealth::Healthy);
        assert_eq!(stats.symbol_count, 4);
    }

    #[test]
    fn test_slow_cycles_degrade() {
        let mut metrics = LoopMetrics::new(Duration::from_millis(100), 20);
        let stats = metrics.record(Duration::from_millis(200), 2, 2);
        assert_eq!(stats.health, LoopHealth::Degraded);
        let stats = metrics.record(Duration::from_millis(1000), 2, 2);
        assert_eq!(stats.health, LoopHealth::Unhealthy);
    }
}
