use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{text_enum, ConfigKey, Direction};

text_enum! {
    /// Lifecycle phase of a base position aggregate
    pub enum Phase {
        Evaluating => "evaluating",
        Active => "active",
        Paused => "paused",
        Failed => "failed",
    }
}

text_enum! {
    pub enum TrialLevel {
        Base => "base",
        Main => "main",
        Preset => "preset",
    }
}

text_enum! {
    pub enum TrialStatus {
        BaseActive => "base_active",
        MainActive => "main_active",
        PresetActive => "preset_active",
        Closed => "closed",
    }
}

impl TrialLevel {
    /// Status a freshly opened trial of this level carries
    pub fn active_status(&self) -> TrialStatus {
        match self {
            TrialLevel::Base => TrialStatus::BaseActive,
            TrialLevel::Main => TrialStatus::MainActive,
            TrialLevel::Preset => TrialStatus::PresetActive,
        }
    }
}

impl TrialStatus {
    pub fn is_active(&self) -> bool {
        !matches!(self, TrialStatus::Closed)
    }
}

text_enum! {
    pub enum CloseReason {
        TakeProfit => "take_profit",
        StopLoss => "stop_loss",
        TrailingStop => "trailing_stop",
        Manual => "manual",
    }
}

/// Running statistics for one configuration (one row per ConfigKey).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasePositionAggregate {
    pub id: Uuid,
    pub key: ConfigKey,
    pub phase: Phase,
    pub total_positions: u32,
    pub winning_positions: u32,
    pub losing_positions: u32,
    pub total_profit_loss: f64,
    pub win_rate: f64,
    pub avg_profit: f64,
    pub avg_loss: f64,
    pub max_drawdown: f64,
    /// Drawdown of recent closes, decayed on every close; drives pause and resume
    #[serde(default)]
    pub recent_drawdown: f64,
    pub capacity: u32,
    pub last_trial_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BasePositionAggregate {
    pub fn new(key: ConfigKey, capacity: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            key,
            phase: Phase::Evaluating,
            total_positions: 0,
            winning_positions: 0,
            losing_positions: 0,
            total_profit_loss: 0.0,
            win_rate: 0.0,
            avg_profit: 0.0,
            avg_loss: 0.0,
            max_drawdown: 0.0,
            recent_drawdown: 0.0,
            capacity,
            last_trial_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// (avgProfit * winRate) / (avgLoss * (1 - winRate))
    pub fn profit_factor(&self) -> f64 {
        profit_factor(self.avg_profit, self.avg_loss, self.win_rate)
    }

    /// avgProfit / avgLoss, infinite when no loss has been recorded yet
    pub fn profit_ratio(&self) -> f64 {
        if self.avg_loss <= 0.0 {
            if self.avg_profit > 0.0 {
                f64::INFINITY
            } else {
                0.0
            }
        } else {
            self.avg_profit / self.avg_loss
        }
    }
}

/// Win-rate weighted ratio of average win to average loss.
///
/// A series without losses but with profit is unbounded; a series without
/// any profit is zero.
pub fn profit_factor(avg_profit: f64, avg_loss: f64, win_rate: f64) -> f64 {
    let gross_win = avg_profit * win_rate;
    let gross_loss = avg_loss * (1.0 - win_rate);
    if gross_loss <= 0.0 {
        if gross_win > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        gross_win / gross_loss
    }
}

/// One simulated trade belonging to an aggregate (base/main) or to a
/// preset strategy (no aggregate).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PseudoPositionTrial {
    pub id: Uuid,
    pub aggregate_id: Option<Uuid>,
    pub level: TrialLevel,
    pub key: ConfigKey,
    pub status: TrialStatus,
    pub entry_price: f64,
    pub current_price: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub trailing_active: bool,
    pub best_price: f64,
    /// Largest adverse excursion seen while open, in percent of entry
    pub max_adverse_pct: f64,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_price: Option<f64>,
    /// Realized P&L in percent of entry
    pub realized_pnl: Option<f64>,
    pub close_reason: Option<CloseReason>,
}

impl PseudoPositionTrial {
    pub fn open(
        level: TrialLevel,
        aggregate_id: Option<Uuid>,
        key: ConfigKey,
        entry_price: f64,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id,
            level,
            status: level.active_status(),
            entry_price,
            current_price: entry_price,
            take_profit_price: key.take_profit_price(entry_price),
            stop_loss_price: key.stop_loss_price(entry_price),
            trailing_active: false,
            best_price: entry_price,
            max_adverse_pct: 0.0,
            created_at: opened_at,
            closed_at: None,
            close_price: None,
            realized_pnl: None,
            close_reason: None,
            key,
        }
    }

    pub fn direction(&self) -> Direction {
        self.key.direction
    }

    pub fn is_win(&self) -> bool {
        self.realized_pnl.map(|p| p > 0.0).unwrap_or(false)
    }

    /// Hours between opening and closing, if closed
    pub fn open_hours(&self) -> Option<f64> {
        self.closed_at
            .map(|closed| (closed - self.created_at).num_milliseconds() as f64 / 3_600_000.0)
    }
}

text_enum! {
    /// `out_of_sync` marks an exchange order that has no local position
    pub enum RealStatus {
        Validated => "validated",
        Mirroring => "mirroring",
        Mirrored => "mirrored",
        Rejected => "rejected",
        OutOfSync => "out_of_sync",
    }
}

impl RealStatus {
    /// Still owed work by the mirror sweep or by manual reconciliation
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            RealStatus::Validated | RealStatus::Mirroring | RealStatus::OutOfSync
        )
    }
}

/// A validated trading decision waiting to be mirrored on the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealPseudoPosition {
    pub id: Uuid,
    pub connection_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub main_trial_id: Uuid,
    pub aggregate_id: Uuid,
    pub status: RealStatus,
    pub reference_price: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub trailing_enabled: bool,
    pub trail_start: Option<f64>,
    pub trail_stop: Option<f64>,
    pub profit_factor: f64,
    pub avg_drawdown_hours: f64,
    pub mirror_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

text_enum! {
    pub enum ExchangePositionStatus {
        Open => "open",
        Closed => "closed",
    }
}

text_enum! {
    pub enum SyncStatus {
        Synced => "synced",
        CloseFailed => "close_failed",
    }
}

/// Live counterpart of a mirrored real position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub id: Uuid,
    pub real_id: Uuid,
    pub connection_id: String,
    pub exchange: String,
    pub symbol: String,
    pub direction: Direction,
    pub exchange_order_id: Option<String>,
    pub entry_price: f64,
    pub volume: f64,
    pub leverage: u32,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub trailing_enabled: bool,
    pub trail_start: Option<f64>,
    pub trail_stop: Option<f64>,
    pub trailing_active: bool,
    pub best_price: f64,
    pub current_price: f64,
    /// Unrealized P&L in quote currency
    pub unrealized_pnl: f64,
    /// Highest P&L seen, percent of margin
    pub max_profit_pct: f64,
    /// Lowest P&L seen, percent of margin
    pub max_loss_pct: f64,
    pub status: ExchangePositionStatus,
    pub sync_status: SyncStatus,
    pub close_reason: Option<CloseReason>,
    pub close_order_id: Option<String>,
    pub realized_pnl: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl ExchangePosition {
    /// P&L in percent of margin at `price`, leverage included
    pub fn pnl_pct_at(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.direction.sign() * (price - self.entry_price) / self.entry_price
            * 100.0
            * self.leverage as f64
    }

    /// P&L in quote currency at `price`
    pub fn pnl_at(&self, price: f64) -> f64 {
        self.direction.sign() * (price - self.entry_price) * self.volume
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sample_key;

    #[test]
    fn test_profit_factor() {
        // 50% win rate, avg win 12, avg loss 8 => 1.5
        assert!((profit_factor(12.0, 8.0, 0.5) - 1.5).abs() < 1e-9);
        assert_eq!(profit_factor(5.0, 0.0, 1.0), f64::INFINITY);
        assert_eq!(profit_factor(0.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn test_trial_open_sets_levels() {
        let key = sample_key("c", "ETHUSDT");
        let trial = PseudoPositionTrial::open(TrialLevel::Main, None, key, 200.0, Utc::now());
        assert_eq!(trial.status, TrialStatus::MainActive);
        assert!((trial.take_profit_price - 202.0).abs() < 1e-9);
        assert!((trial.stop_loss_price - 199.0).abs() < 1e-9);
        assert!(trial.status.is_active());
    }

    #[test]
    fn test_exchange_pnl() {
        let position = ExchangePosition {
            id: Uuid::new_v4(),
            real_id: Uuid::new_v4(),
            connection_id: "c".into(),
            exchange: "paper".into(),
            symbol: "BTCUSDT".into(),
            direction: Direction::Short,
            exchange_order_id: None,
            entry_price: 100.0,
            volume: 2.0,
            leverage: 10,
            take_profit_price: 98.0,
            stop_loss_price: 101.0,
            trailing_enabled: false,
            trail_start: None,
            trail_stop: None,
            trailing_active: false,
            best_price: 100.0,
            current_price: 100.0,
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
        assert!((position.pnl_at(99.0) - 2.0).abs() < 1e-9);
        assert!((position.pnl_pct_at(99.0) - 10.0).abs() < 1e-9);
    }
}
