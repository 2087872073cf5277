use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::config::SizingConfig;

/// Volume and leverage of a position about to be mirrored
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSize {
    pub volume: f64,
    pub leverage: u32,
    /// Margin committed, quote currency
    pub margin: f64,
}

/// Size a position from the account balance.
///
/// Margin is `balance * position_cost_ratio`; volume is margin times
/// leverage divided by price, rounded down to `volume_step`. Returns `None`
/// when the result is below `min_volume` or the inputs are unusable.
pub fn size_position(balance: f64, price: f64, config: &SizingConfig) -> Option<PositionSize> {
    if balance <= 0.0 || price <= 0.0 || config.volume_step <= 0.0 {
        return None;
    }

    let leverage = config.leverage.clamp(1, config.max_leverage.max(1));
    let balance = Decimal::from_f64(balance)?;
    let price = Decimal::from_f64(price)?;
    let ratio = Decimal::from_f64(config.position_cost_ratio)?;
    let step = Decimal::from_f64(config.volume_step)?;

    let margin = balance * ratio;
    let notional = margin * Decimal::from(leverage);
    let raw_volume = notional / price;
    let steps = (raw_volume / step).round_dp_with_strategy(0, RoundingStrategy::ToZero);
    let volume = (steps * step).normalize();

    let volume = volume.to_f64()?;
    if volume < config.min_volume || volume <= 0.0 {
        return None;
    }

    Some(PositionSize {
        volume,
        leverage,
        margin: margin.to_f64()?,
    })
}
