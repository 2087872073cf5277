//! Signal algorithms, one per indication type.
//!
//! All functions are pure over a price series and return the direction a
//! new position should take, or `None` when the pattern is absent.

use chrono::{DateTime, Duration, Utc};

use crate::indicators::{drawdown_pct, percent_change, range_pct};
use crate::models::{Direction, PriceTick};

/// Lookback of the Active indication
pub const ACTIVE_LOOKBACK_SECS: i64 = 60;
/// Minimum share of steps that must agree for a Move signal
pub const MOVE_MIN_PURITY: f64 = 0.6;
/// Minimum net displacement, percent, for a Move signal
pub const MOVE_MIN_DISPLACEMENT_PCT: f64 = 0.3;
/// Share of the window that forms the "last part" in Active-Advanced
pub const ADVANCED_LAST_PART: f64 = 0.2;
/// The last part must carry this share of the overall move
pub const ADVANCED_CONTINUATION: f64 = 0.6;
pub const ADVANCED_MIN_VOLATILITY_PCT: f64 = 0.1;
pub const ADVANCED_MAX_DRAWDOWN_PCT: f64 = 5.0;

/// Step-count reversal detector.
///
/// `newest_first` lists prices from the latest sample backwards. Each step
/// compares a sample with the next older one: `range` consecutive declines
/// along that walk mean the market is stretched one way and a long reversal
/// is expected; `range` consecutive rises mean short. A flat step resets
/// both counters.
pub fn detect_direction(newest_first: &[f64], range: usize) -> Option<Direction> {
    if range == 0 || newest_first.len() < range + 1 {
        return None;
    }

    let mut downs = 0usize;
    let mut ups = 0usize;
    for i in 0..range {
        let step = newest_first[i + 1] - newest_first[i];
        if step < 0.0 {
            downs += 1;
            ups = 0;
        } else if step > 0.0 {
            ups += 1;
            downs = 0;
        } else {
            downs = 0;
            ups = 0;
        }
    }

    if downs >= range {
        Some(Direction::Long)
    } else if ups >= range {
        Some(Direction::Short)
    } else {
        None
    }
}

/// Continuation detector over the last `range` steps (chronological input).
///
/// Fires in the dominant direction when at least 60% of the steps agree and
/// the net displacement is at least 0.3% the same way.
pub fn detect_move(chronological: &[f64], range: usize) -> Option<Direction> {
    if range == 0 || chronological.len() < range + 1 {
        return None;
    }

    let window = &chronological[chronological.len() - range - 1..];
    let (ups, downs) = window.windows(2).fold((0usize, 0usize), |(u, d), w| {
        if w[1] > w[0] {
            (u + 1, d)
        } else if w[1] < w[0] {
            (u, d + 1)
        } else {
            (u, d)
        }
    });

    let displacement = percent_change(window[0], window[range]);
    let (dominant, count) = if ups >= downs {
        (Direction::Long, ups)
    } else {
        (Direction::Short, downs)
    };

    let purity = count as f64 / range as f64;
    if purity < MOVE_MIN_PURITY || displacement.abs() < MOVE_MIN_DISPLACEMENT_PCT {
        return None;
    }
    if dominant.sign() * displacement <= 0.0 {
        return None;
    }
    Some(dominant)
}

/// Price of the last tick at or before `at`
fn price_at(ticks: &[PriceTick], at: DateTime<Utc>) -> Option<f64> {
    ticks
        .iter()
        .rev()
        .find(|tick| tick.timestamp <= at)
        .map(|tick| tick.price)
}

/// Fires when the latest price moved at least `threshold_pct` from the price
/// one minute earlier; follows the move.
pub fn detect_active(ticks: &[PriceTick], now: DateTime<Utc>, threshold_pct: f64) -> Option<Direction> {
    let current = ticks.last()?.price;
    let reference = price_at(ticks, now - Duration::seconds(ACTIVE_LOOKBACK_SECS))?;
    let change = percent_change(reference, current);

    if change.abs() < threshold_pct || change == 0.0 {
        return None;
    }
    Some(if change > 0.0 {
        Direction::Long
    } else {
        Direction::Short
    })
}

/// Window-based momentum detector for one (activity ratio, time window)
/// pair. All of the following must hold inside the window:
/// - overall change is at least `activity_ratio_pct`
/// - the last 20% of the window carries at least 60% of that move, same way
/// - (max - min) / min is at least 0.1%
/// - the final step is not flat
/// - the adverse drawdown stays within 5%
pub fn detect_active_advanced(
    ticks: &[PriceTick],
    now: DateTime<Utc>,
    activity_ratio_pct: f64,
    window_secs: u64,
) -> Option<Direction> {
    let window_start = now - Duration::seconds(window_secs as i64);
    let start_idx = ticks.iter().position(|t| t.timestamp >= window_start)?;
    let window = &ticks[start_idx..];
    if window.len() < 3 {
        return None;
    }

    let prices: Vec<f64> = window.iter().map(|t| t.price).collect();
    let first = prices[0];
    let last = prices[prices.len() - 1];
    let overall = percent_change(first, last);
    if overall.abs() < activity_ratio_pct || overall == 0.0 {
        return None;
    }
    let direction = if overall > 0.0 {
        Direction::Long
    } else {
        Direction::Short
    };

    let last_part_ms = (window_secs as f64 * 1000.0 * ADVANCED_LAST_PART) as i64;
    let last_part_start = now - Duration::milliseconds(last_part_ms);
    let split = price_at(window, last_part_start).unwrap_or(first);
    let last_part = percent_change(split, last);
    if direction.sign() * last_part < ADVANCED_CONTINUATION * overall.abs() {
        return None;
    }

    if range_pct(&prices) < ADVANCED_MIN_VOLATILITY_PCT {
        return None;
    }

    if prices[prices.len() - 1] == prices[prices.len() - 2] {
        return None;
    }

    if drawdown_pct(&prices, direction.sign()) > ADVANCED_MAX_DRAWDOWN_PCT {
        return None;
    }

    Some(direction)
}

/// Extra gates of the Optimal indication
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimalParams {
    /// Largest allowed retrace from the extreme, as a share of the move
    pub drawdown_ratio: f64,
    /// Minimum market change across the window, percent
    pub market_change_range: f64,
    /// Share of the move the last part of the window must carry
    pub last_part_ratio: f64,
}

/// Direction signal confirmed by a single snapshot of the window it covers:
/// the market moved at least `market_change_range`, gave back at most
/// `drawdown_ratio` of its extreme, and its last part carried at least
/// `last_part_ratio` of the move.
pub fn detect_optimal(newest_first: &[f64], range: usize, params: OptimalParams) -> Option<Direction> {
    let signal = detect_direction(newest_first, range)?;

    let mut window: Vec<f64> = newest_first[..=range].to_vec();
    window.reverse();
    let first = window[0];
    let last = window[range];
    let change = percent_change(first, last);
    if change.abs() < params.market_change_range || change == 0.0 {
        return None;
    }

    let sign = change.signum();
    let extreme = window
        .iter()
        .map(|p| sign * percent_change(first, *p))
        .fold(0.0_f64, f64::max);
    let retrace = extreme - sign * change;
    if retrace > params.drawdown_ratio * extreme {
        return None;
    }

    let last_steps = ((range as f64 * params.last_part_ratio).ceil() as usize).clamp(1, range);
    let split = window[range - last_steps];
    let last_part = sign * percent_change(split, last);
    if last_part < params.last_part_ratio * change.abs() {
        return None;
    }

    Some(signal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticks_every_second(prices: &[f64], now: DateTime<Utc>) -> Vec<PriceTick> {
        let n = prices.len() as i64;
        prices
            .iter()
            .enumerate()
            .map(|(i, p)| PriceTick::new(*p, now - Duration::seconds(n - 1 - i as i64)))
            .collect()
    }

    #[test]
    fn test_direction_declines_expect_long() {
        let prices = [100.0, 99.0, 98.0, 97.0, 96.0, 95.0];
        assert_eq!(detect_direction(&prices, 5), Some(Direction::Long));
    }

    #[test]
    fn test_direction_increases_expect_short() {
        let prices = [95.0, 96.0, 97.0, 98.0, 99.0, 100.0];
        assert_eq!(detect_direction(&prices, 5), Some(Direction::Short));
    }

    #[test]
    fn test_direction_flat_step_resets() {
        let prices = [100.0, 99.0, 99.0, 97.0, 96.0, 95.0];
        assert_eq!(detect_direction(&prices, 5), None);
        // Too short for the range
        assert_eq!(detect_direction(&prices[..5], 5), None);
        // Only the newest `range` steps count
        let longer = [100.0, 99.0, 98.0, 97.0, 96.0, 95.0, 96.0, 97.0];
        assert_eq!(detect_direction(&longer, 5), Some(Direction::Long));
    }

    #[test]
    fn test_move_requires_purity_and_displacement() {
        // 4 of 5 steps up, +1% net
        let up = [100.0, 100.3, 100.6, 100.5, 100.8, 101.0];
        assert_eq!(detect_move(&up, 5), Some(Direction::Long));

        // Steps agree but the move is tiny
        let tiny = [100.0, 100.01, 100.02, 100.03, 100.04, 100.05];
        assert_eq!(detect_move(&tiny, 5), None);

        // Choppy: 3 up, 2 down = 0.6 purity, but net move is down
        let choppy = [100.0, 100.1, 99.0, 99.1, 98.0, 98.1];
        assert_eq!(detect_move(&choppy, 5), None);

        let down = [101.0, 100.7, 100.4, 100.5, 100.2, 100.0];
        assert_eq!(detect_move(&down, 5), Some(Direction::Short));
    }

    #[test]
    fn test_active_compares_with_one_minute_ago() {
        let now = Utc::now();
        let ticks = vec![
            PriceTick::new(100.0, now - Duration::seconds(90)),
            PriceTick::new(100.0, now - Duration::seconds(61)),
            PriceTick::new(100.5, now - Duration::seconds(30)),
            PriceTick::new(101.2, now),
        ];
        assert_eq!(detect_active(&ticks, now, 1.0), Some(Direction::Long));
        assert_eq!(detect_active(&ticks, now, 1.5), None);

        let falling = vec![
            PriceTick::new(100.0, now - Duration::seconds(60)),
            PriceTick::new(98.0, now),
        ];
        assert_eq!(detect_active(&falling, now, 2.0), Some(Direction::Short));

        // No sample old enough
        let young = vec![PriceTick::new(100.0, now - Duration::seconds(10)), PriceTick::new(103.0, now)];
        assert_eq!(detect_active(&young, now, 0.5), None);
    }

    #[test]
    fn test_active_advanced_accepts_accelerating_move() {
        let now = Utc::now();
        // 10 second window, last 2 seconds carry most of a +0.5% move
        let prices = [100.0, 100.0, 100.02, 100.03, 100.05, 100.06, 100.08, 100.1, 100.3, 100.5];
        let ticks = ticks_every_second(&prices, now);
        assert_eq!(
            detect_active_advanced(&ticks, now, 0.3, 10),
            Some(Direction::Long)
        );
        // Overall change below the ratio
        assert_eq!(detect_active_advanced(&ticks, now, 1.0, 10), None);
    }

    #[test]
    fn test_active_advanced_rejects_stalled_end() {
        let now = Utc::now();
        let prices = [100.0, 100.1, 100.2, 100.3, 100.4, 100.5, 100.6, 100.7, 100.8, 100.8];
        let ticks = ticks_every_second(&prices, now);
        assert_eq!(detect_active_advanced(&ticks, now, 0.3, 10), None);
    }

    #[test]
    fn test_optimal_gates() {
        // Newest first: market climbed steadily 1% in 5 steps
        let prices = [101.0, 100.8, 100.6, 100.4, 100.2, 100.0];
        let loose = OptimalParams {
            drawdown_ratio: 0.2,
            market_change_range: 0.5,
            last_part_ratio: 0.2,
        };
        assert_eq!(detect_direction(&prices, 5), Some(Direction::Long));
        assert_eq!(detect_optimal(&prices, 5, loose), Some(Direction::Long));

        let demanding = OptimalParams {
            market_change_range: 2.0,
            ..loose
        };
        assert_eq!(detect_optimal(&prices, 5, demanding), None);
    }
}
