//! Indication detection: per-symbol signals that seed the base pool.
//!
//! [`algorithms`] holds the pure pattern checks, [`matrix`] expands a fired
//! signal into every TP / SL / trailing configuration, and [`detector`]
//! drives both across all enabled parameter combinations of a symbol.

pub mod algorithms;
pub mod detector;
pub mod matrix;

use chrono::{DateTime, Utc};
use std::fmt;

use crate::models::{Direction, IndicationType};

pub use algorithms::OptimalParams;
pub use detector::{DetectionSummary, IndicationDetector};
pub use matrix::build_config_matrix;

/// One parameter combination of one indication type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndicationParam {
    Direction { range: u32 },
    Move { range: u32 },
    Active { threshold_pct: f64 },
    ActiveAdvanced { activity_ratio_pct: f64, window_secs: u64 },
    Optimal { range: u32, params: OptimalParams },
}

impl IndicationParam {
    pub fn indication_type(&self) -> IndicationType {
        match self {
            IndicationParam::Direction { .. } => IndicationType::Direction,
            IndicationParam::Move { .. } => IndicationType::Move,
            IndicationParam::Active { .. } => IndicationType::Active,
            IndicationParam::ActiveAdvanced { .. } => IndicationType::ActiveAdvanced,
            IndicationParam::Optimal { .. } => IndicationType::Optimal,
        }
    }

    /// The range or threshold that becomes part of the ConfigKey
    pub fn range_or_threshold(&self) -> f64 {
        match *self {
            IndicationParam::Direction { range }
            | IndicationParam::Move { range }
            | IndicationParam::Optimal { range, .. } => range as f64,
            IndicationParam::Active { threshold_pct } => threshold_pct,
            IndicationParam::ActiveAdvanced { activity_ratio_pct, .. } => activity_ratio_pct,
        }
    }

    pub fn optimal(&self) -> Option<OptimalParams> {
        match self {
            IndicationParam::Optimal { params, .. } => Some(*params),
            _ => None,
        }
    }
}

impl fmt::Display for IndicationParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndicationParam::Direction { range } | IndicationParam::Move { range } => {
                write!(f, "{}", range)
            }
            IndicationParam::Active { threshold_pct } => write!(f, "{:.2}", threshold_pct),
            IndicationParam::ActiveAdvanced { activity_ratio_pct, window_secs } => {
                write!(f, "{:.2}@{}s", activity_ratio_pct, window_secs)
            }
            IndicationParam::Optimal { range, params } => write!(
                f,
                "{}/{:.2}/{:.2}/{:.2}",
                range, params.drawdown_ratio, params.market_change_range, params.last_part_ratio
            ),
        }
    }
}

/// A fired signal for one symbol and parameter combination
#[derive(Debug, Clone, PartialEq)]
pub struct Indication {
    pub connection_id: String,
    pub symbol: String,
    pub param: IndicationParam,
    pub direction: Direction,
    /// Price the signal fired at; becomes the entry of the base trials
    pub price: f64,
    pub detected_at: DateTime<Utc>,
}

impl Indication {
    pub fn indication_type(&self) -> IndicationType {
        self.param.indication_type()
    }
}

/// Cooldown-gate key of a parameter combination:
/// `{connection}:{symbol}:{type}:{param}`
pub fn state_key(connection_id: &str, symbol: &str, param: &IndicationParam) -> String {
    format!(
        "{}:{}:{}:{}",
        connection_id,
        symbol,
        param.indication_type(),
        param
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_keys_distinguish_windows() {
        let a = IndicationParam::ActiveAdvanced { activity_ratio_pct: 0.5, window_secs: 10 };
        let b = IndicationParam::ActiveAdvanced { activity_ratio_pct: 0.5, window_secs: 20 };
        assert_eq!(state_key("c", "BTCUSDT", &a), "c:BTCUSDT:active_advanced:0.50@10s");
        assert_ne!(state_key("c", "BTCUSDT", &a), state_key("c", "BTCUSDT", &b));
        assert_eq!(
            state_key("c", "BTCUSDT", &IndicationParam::Direction { range: 7 }),
            "c:BTCUSDT:direction:7"
        );
    }
}
