// Technical indicators over plain price series (oldest first)
// RSI and EMA feed the preset strategies; price_action feeds the detectors

pub mod moving_average;
pub mod price_action;
pub mod rsi;

pub use moving_average::ema_series;
pub use price_action::{drawdown_pct, percent_change, range_pct};
pub use rsi::calculate_rsi;
