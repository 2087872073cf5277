// Realtime marking of pseudo trials and live exchange positions
pub mod exchange;
pub mod trial;

pub use exchange::mark_exchange_position;
pub use trial::{close_trial, mark_trial, trial_pnl_pct};
