use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Take-profit factors are expressed in steps of this many percent.
pub const TAKE_PROFIT_UNIT_PCT: f64 = 0.1;

/// Declares a fieldless enum stored as text, with `as_str`, `FromStr` and
/// `Display` over the given labels.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $label:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::EngineError;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                match s {
                    $($label => Ok($name::$variant),)+
                    other => Err(crate::EngineError::InvalidState(format!(
                        "invalid {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub(crate) use text_enum;

pub mod positions;
pub mod records;

pub use positions::*;
pub use records::*;

text_enum! {
    /// Trade direction of a trial or position
    pub enum Direction {
        Long => "long",
        Short => "short",
    }
}

impl Direction {
    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

text_enum! {
    /// Family of indication that produced a configuration
    pub enum IndicationType {
        Direction => "direction",
        Move => "move",
        Active => "active",
        ActiveAdvanced => "active_advanced",
        Optimal => "optimal",
        Preset => "preset",
    }
}

/// A single price observation for a symbol
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl PriceTick {
    pub fn new(price: f64, timestamp: DateTime<Utc>) -> Self {
        Self { price, timestamp }
    }
}

/// Immutable identity of one trading hypothesis.
///
/// Floats make the struct unsuitable as a map key, so identity goes through
/// [`ConfigKey::fingerprint`], a canonical text rendering that is also the
/// unique column in storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigKey {
    pub connection_id: String,
    pub symbol: String,
    pub indication_type: IndicationType,
    pub range_or_threshold: f64,
    pub direction: Direction,
    pub take_profit_factor: f64,
    pub stop_loss_ratio: f64,
    pub trailing_enabled: bool,
    pub trail_start: Option<f64>,
    pub trail_stop: Option<f64>,
    pub drawdown_ratio: Option<f64>,
    pub market_change_range: Option<f64>,
    pub last_part_ratio: Option<f64>,
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| format!("{:.4}", v)).unwrap_or_else(|| "-".to_string())
}

impl ConfigKey {
    /// Canonical identity of the full configuration
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{:.4}|{}|{:.4}|{:.4}|{}|{}|{}|{}|{}|{}",
            self.connection_id,
            self.symbol,
            self.indication_type,
            self.range_or_threshold,
            self.direction,
            self.take_profit_factor,
            self.stop_loss_ratio,
            self.trailing_enabled,
            fmt_opt(self.trail_start),
            fmt_opt(self.trail_stop),
            fmt_opt(self.drawdown_ratio),
            fmt_opt(self.market_change_range),
            fmt_opt(self.last_part_ratio),
        )
    }

    /// Identity of the concurrency slot this configuration competes for:
    /// (connection, symbol, indication type, direction, TP, SL, trailing).
    ///
    /// At most `max_positions_per_config` trials may be active per slot.
    pub fn slot_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{:.4}|{:.4}|{}|{}|{}",
            self.connection_id,
            self.symbol,
            self.indication_type,
            self.direction,
            self.take_profit_factor,
            self.stop_loss_ratio,
            self.trailing_enabled,
            fmt_opt(self.trail_start),
            fmt_opt(self.trail_stop),
        )
    }

    pub fn take_profit_pct(&self) -> f64 {
        self.take_profit_factor * TAKE_PROFIT_UNIT_PCT
    }

    pub fn stop_loss_pct(&self) -> f64 {
        self.take_profit_pct() * self.stop_loss_ratio
    }

    /// Price at which a position entered at `entry` takes profit
    pub fn take_profit_price(&self, entry: f64) -> f64 {
        entry * (1.0 + self.direction.sign() * self.take_profit_pct() / 100.0)
    }

    /// Price at which a position entered at `entry` is stopped out
    pub fn stop_loss_price(&self, entry: f64) -> f64 {
        entry * (1.0 - self.direction.sign() * self.stop_loss_pct() / 100.0)
    }
}

#[cfg(test)]
pub(crate) fn sample_key(connection: &str, symbol: &str) -> ConfigKey {
    ConfigKey {
        connection_id: connection.to_string(),
        symbol: symbol.to_string(),
        indication_type: IndicationType::Direction,
        range_or_threshold: 5.0,
        direction: Direction::Long,
        take_profit_factor: 10.0,
        stop_loss_ratio: 0.5,
        trailing_enabled: false,
        trail_start: None,
        trail_stop: None,
        drawdown_ratio: None,
        market_change_range: None,
        last_part_ratio: None,
    }
}

/// A `validated` real position on BTCUSDT for `aggregate_id`
#[cfg(test)]
pub(crate) fn sample_real(connection: &str, aggregate_id: uuid::Uuid) -> RealPseudoPosition {
    let key = sample_key(connection, "BTCUSDT");
    let now = Utc::now();
    RealPseudoPosition {
        id: uuid::Uuid::new_v4(),
        connection_id: connection.to_string(),
        symbol: key.symbol.clone(),
        direction: key.direction,
        main_trial_id: uuid::Uuid::new_v4(),
        aggregate_id,
        status: RealStatus::Validated,
        reference_price: 100.0,
        take_profit_price: key.take_profit_price(100.0),
        stop_loss_price: key.stop_loss_price(100.0),
        take_profit_pct: key.take_profit_pct(),
        stop_loss_pct: key.stop_loss_pct(),
        trailing_enabled: false,
        trail_start: None,
        trail_stop: None,
        profit_factor: 2.0,
        avg_drawdown_hours: 1.0,
        mirror_attempts: 0,
        created_at: now,
        updated_at: now,
    }
}
