use crate::models::{CloseReason, ExchangePosition};

/// Mark a live position at `price`: running P&L, P&L extremes, best price
/// and trailing state. Returns the exit that should be executed, if any.
///
/// Unlike pseudo trials the position is not closed here; it closes only
/// once the exchange confirms the reduce-only order.
pub fn mark_exchange_position(position: &mut ExchangePosition, price: f64) -> Option<CloseReason> {
    if price <= 0.0 {
        return None;
    }

    let sign = position.direction.sign();
    position.current_price = price;
    position.unrealized_pnl = position.pnl_at(price);

    let pnl_pct = position.pnl_pct_at(price);
    position.max_profit_pct = position.max_profit_pct.max(pnl_pct);
    position.max_loss_pct = position.max_loss_pct.min(pnl_pct);

    if sign * (price - position.best_price) > 0.0 {
        position.best_price = price;
    }

    if position.trailing_enabled && !position.trailing_active {
        if let Some(start) = position.trail_start {
            let best_move = sign * (position.best_price - position.entry_price) / position.entry_price * 100.0;
            if best_move >= start {
                position.trailing_active = true;
                tracing::info!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    best_price = position.best_price,
                    "Trailing stop activated"
                );
            }
        }
    }

    if sign * (price - position.stop_loss_price) <= 0.0 {
        return Some(CloseReason::StopLoss);
    }
    if position.trailing_active {
        let stop = position.trail_stop.unwrap_or(0.0);
        let retrace = sign * (position.best_price - price) / position.best_price * 100.0;
        return (retrace >= stop).then_some(CloseReason::TrailingStop);
    }
    if sign * (price - position.take_profit_price) >= 0.0 {
        return Some(CloseReason::TakeProfit);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, ExchangePositionStatus, SyncStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn position(direction: Direction, trailing: Option<(f64, f64)>) -> ExchangePosition {
        let sign = direction.sign();
        ExchangePosition {
            id: Uuid::new_v4(),
            real_id: Uuid::new_v4(),
            connection_id: "c".into(),
            exchange: "paper".into(),
            symbol: "BTCUSDT".into(),
            direction,
            exchange_order_id: Some("paper-1".into()),
            entry_price: 100.0,
            volume: 1.0,
            leverage: 10,
            take_profit_price: 100.0 * (1.0 + sign * 0.01),
            stop_loss_price: 100.0 * (1.0 - sign * 0.005),
            trailing_enabled: trailing.is_some(),
            trail_start: trailing.map(|t| t.0),
            trail_stop: trailing.map(|t| t.1),
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
        }
    }

    #[test]
    fn test_extremes_and_take_profit() {
        let mut p = position(Direction::Long, None);
        assert_eq!(mark_exchange_position(&mut p, 99.8), None);
        assert_eq!(mark_exchange_position(&mut p, 100.4), None);
        assert!((p.max_loss_pct + 2.0).abs() < 1e-9);
        assert!((p.max_profit_pct - 4.0).abs() < 1e-9);
        assert!((p.unrealized_pnl - 0.4).abs() < 1e-9);

        assert_eq!(mark_exchange_position(&mut p, 101.1), Some(CloseReason::TakeProfit));
    }

    #[test]
    fn test_short_stop_loss() {
        let mut p = position(Direction::Short, None);
        assert_eq!(mark_exchange_position(&mut p, 100.6), Some(CloseReason::StopLoss));
    }

    #[test]
    fn test_trailing_stop() {
        let mut p = position(Direction::Long, Some((0.3, 0.1)));
        assert_eq!(mark_exchange_position(&mut p, 100.5), None);
        assert!(p.trailing_active);
        assert_eq!(mark_exchange_position(&mut p, 101.2), None);
        assert_eq!(mark_exchange_position(&mut p, 101.05), Some(CloseReason::TrailingStop));
    }
}
