/// Percent change from `from` to `to`; zero when `from` is not positive
pub fn percent_change(from: f64, to: f64) -> f64 {
    if from <= 0.0 {
        return 0.0;
    }
    (to - from) / from * 100.0
}

/// (max - min) / min in percent
pub fn range_pct(prices: &[f64]) -> f64 {
    let min = prices.iter().copied().fold(f64::INFINITY, f64::min);
    let max = prices.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !min.is_finite() || min <= 0.0 {
        return 0.0;
    }
    (max - min) / min * 100.0
}

/// Worst excursion against a position in `sign` direction (+1 long,
/// -1 short) measured from the running best price, in percent
pub fn drawdown_pct(prices: &[f64], sign: f64) -> f64 {
    let mut best = match prices.first() {
        Some(p) => *p,
        None => return 0.0,
    };
    let mut worst = 0.0_f64;
    for price in prices {
        if sign * (price - best) > 0.0 {
            best = *price;
        }
        worst = worst.max(-sign * percent_change(best, *price));
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_change() {
        assert!((percent_change(100.0, 101.5) - 1.5).abs() < 1e-9);
        assert_eq!(percent_change(0.0, 5.0), 0.0);
    }

    #[test]
    fn test_range_pct() {
        assert!((range_pct(&[100.0, 102.0, 101.0]) - 2.0).abs() < 1e-9);
        assert_eq!(range_pct(&[]), 0.0);
    }

    #[test]
    fn test_drawdown_by_direction() {
        let prices = [100.0, 110.0, 99.0, 105.0];
        // Long: peak 110 to 99 is -10%
        assert!((drawdown_pct(&prices, 1.0) - 10.0).abs() < 1e-9);
        // Short: the opening rally from 100 to 110 is +10% against
        assert!((drawdown_pct(&prices, -1.0) - 10.0).abs() < 1e-9);
    }
}
