/// EMA value after every price from index `period - 1` on, seeded with the
/// SMA of the first `period` prices
pub fn ema_series(prices: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || prices.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = prices[..period].iter().sum::<f64>() / period as f64;

    let mut series = Vec::with_capacity(prices.len() - period + 1);
    series.push(ema);
    for price in &prices[period..] {
        ema += (price - ema) * multiplier;
        series.push(ema);
    }
    series
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_tracks_trend() {
        let prices = vec![100.0, 102.0, 104.0, 106.0, 108.0, 110.0];
        let series = ema_series(&prices, 5);
        assert_eq!(series.len(), 2);
        assert_eq!(series[0], 104.0);
        // (110 - 104) / 3 above the seed
        assert!((series[1] - 106.0).abs() < 1e-9);
        assert!(ema_series(&prices[..3], 5).is_empty());
    }
}
