use crate::config::IndicationConfig;
use crate::models::{ConfigKey, TAKE_PROFIT_UNIT_PCT};

use super::Indication;

/// Expand a fired indication into every ConfigKey it seeds: each TP factor
/// times each SL ratio, with no trailing and with every trailing preset.
///
/// Combinations whose stop loss would be tighter than `min_stop_loss_pct`
/// are skipped.
pub fn build_config_matrix(indication: &Indication, config: &IndicationConfig) -> Vec<ConfigKey> {
    let optimal = indication.param.optimal();
    let trailing: Vec<Option<(f64, f64)>> = std::iter::once(None)
        .chain(config.trailing_presets.iter().map(|p| Some((p.start, p.stop))))
        .collect();

    let mut keys = Vec::with_capacity(
        config.take_profit_factors.len() * config.stop_loss_ratios.len() * trailing.len(),
    );

    for &tp_factor in &config.take_profit_factors {
        for &sl_ratio in &config.stop_loss_ratios {
            let sl_pct = tp_factor * TAKE_PROFIT_UNIT_PCT * sl_ratio;
            if sl_pct < config.min_stop_loss_pct {
                continue;
            }

            for variant in &trailing {
                keys.push(ConfigKey {
                    connection_id: indication.connection_id.clone(),
                    symbol: indication.symbol.clone(),
                    indication_type: indication.indication_type(),
                    range_or_threshold: indication.param.range_or_threshold(),
                    direction: indication.direction,
                    take_profit_factor: tp_factor,
                    stop_loss_ratio: sl_ratio,
                    trailing_enabled: variant.is_some(),
                    trail_start: variant.map(|(start, _)| start),
                    trail_stop: variant.map(|(_, stop)| stop),
                    drawdown_ratio: optimal.map(|o| o.drawdown_ratio),
                    market_change_range: optimal.map(|o| o.market_change_range),
                    last_part_ratio: optimal.map(|o| o.last_part_ratio),
                });
            }
        }
    }

    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indication::{IndicationParam, OptimalParams};
    use crate::models::Direction;
    use chrono::Utc;
    use std::collections::HashSet;

    fn indication(param: IndicationParam) -> Indication {
        Indication {
            connection_id: "c".into(),
            symbol: "BTCUSDT".into(),
            param,
            direction: Direction::Long,
            price: 100.0,
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn test_default_matrix_size() {
        let config = IndicationConfig::default();
        let keys = build_config_matrix(&indication(IndicationParam::Direction { range: 5 }), &config);

        // 11 x 21 x 4 minus the single (TP 0.2%, SL ratio 0.2) pair whose
        // 0.04% stop is below the floor, times 4 trailing variants
        assert_eq!(keys.len(), 11 * 21 * 4 - 4);

        let unique: HashSet<String> = keys.iter().map(|k| k.fingerprint()).collect();
        assert_eq!(unique.len(), keys.len());
        assert!(keys.iter().all(|k| k.stop_loss_pct() >= config.min_stop_loss_pct));
        assert_eq!(keys.iter().filter(|k| !k.trailing_enabled).count(), keys.len() / 4);
    }

    #[test]
    fn test_optimal_fields_carried() {
        let params = OptimalParams {
            drawdown_ratio: 0.3,
            market_change_range: 0.5,
            last_part_ratio: 0.2,
        };
        let config = IndicationConfig {
            take_profit_factors: vec![10.0],
            stop_loss_ratios: vec![0.5],
            trailing_presets: vec![],
            ..IndicationConfig::default()
        };
        let keys = build_config_matrix(&indication(IndicationParam::Optimal { range: 8, params }), &config);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].range_or_threshold, 8.0);
        assert_eq!(keys[0].drawdown_ratio, Some(0.3));
        assert_eq!(keys[0].last_part_ratio, Some(0.2));
    }
}
