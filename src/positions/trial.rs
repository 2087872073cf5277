use chrono::{DateTime, Utc};

use crate::models::{CloseReason, PseudoPositionTrial, TrialStatus};

/// P&L of a trial at `price`, percent of entry
pub fn trial_pnl_pct(trial: &PseudoPositionTrial, price: f64) -> f64 {
    if trial.entry_price <= 0.0 {
        return 0.0;
    }
    trial.direction().sign() * (price - trial.entry_price) / trial.entry_price * 100.0
}

/// Mark an open trial at `price` and close it when an exit triggers.
///
/// Exits, in order: stop loss; trailing stop once trailing is active;
/// fixed take profit while trailing is inactive. Trailing activates when
/// the best price reaches `trail_start` percent of profit and fires once
/// price gives back `trail_stop` percent from that best price.
pub fn mark_trial(
    trial: &mut PseudoPositionTrial,
    price: f64,
    at: DateTime<Utc>,
) -> Option<CloseReason> {
    if !trial.status.is_active() || price <= 0.0 {
        return None;
    }

    let sign = trial.direction().sign();
    trial.current_price = price;
    if sign * (price - trial.best_price) > 0.0 {
        trial.best_price = price;
    }
    trial.max_adverse_pct = trial.max_adverse_pct.max(-trial_pnl_pct(trial, price));

    if trial.key.trailing_enabled && !trial.trailing_active {
        if let Some(start) = trial.key.trail_start {
            if trial_pnl_pct(trial, trial.best_price) >= start {
                trial.trailing_active = true;
            }
        }
    }

    let reason = if sign * (price - trial.stop_loss_price) <= 0.0 {
        Some(CloseReason::StopLoss)
    } else if trial.trailing_active {
        let stop = trial.key.trail_stop.unwrap_or(0.0);
        let retrace = sign * (trial.best_price - price) / trial.best_price * 100.0;
        (retrace >= stop).then_some(CloseReason::TrailingStop)
    } else if sign * (price - trial.take_profit_price) >= 0.0 {
        Some(CloseReason::TakeProfit)
    } else {
        None
    };

    if let Some(reason) = reason {
        close_trial(trial, price, reason, at);
    }
    reason
}

/// Close a trial at `price`
pub fn close_trial(trial: &mut PseudoPositionTrial, price: f64, reason: CloseReason, at: DateTime<Utc>) {
    trial.current_price = price;
    trial.close_price = Some(price);
    trial.realized_pnl = Some(trial_pnl_pct(trial, price));
    trial.close_reason = Some(reason);
    trial.closed_at = Some(at);
    trial.status = TrialStatus::Closed;
}
