// src/services/strategies/mean_reversion.rs

use super::common::{EntryDecision, Strategy};
use crate::config::strategies::StrategyConfig;
use crate::services::indicators::IndicatorSnapshot;

/// Buy oversold RSI, optionally waiting for a MACD turn and a volume spike.
pub struct MeanReversion;

impl Strategy for MeanReversion {
    fn name(&self) -> &'static str {
        "meanReversion"
    }

    fn evaluate_entry(&self, ind: &IndicatorSnapshot, cfg: &StrategyConfig, _price: f64) -> EntryDecision {
        let rsi = ind.rsi.current;
        if !(rsi < cfg.rsi_threshold) {
            return EntryDecision::reject(format!(
                "mean reversion: RSI {rsi:.2} not below {}",
                cfg.rsi_threshold
            ));
        }
        if cfg.macd_cross_needed && !(ind.macd.value > ind.macd.signal && ind.macd.histogram > 0.0) {
            return EntryDecision::reject("mean reversion: MACD has not crossed up");
        }
        if cfg.require_volume_spike && !ind.volume_spike {
            return EntryDecision::reject("mean reversion: no volume spike");
        }
        EntryDecision::enter(format!("mean reversion: RSI {rsi:.2} oversold, reversal confirmed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::strategies;

    fn oversold() -> IndicatorSnapshot {
        let mut ind = IndicatorSnapshot::default();
        ind.rsi.current = 20.0;
        ind.macd.value = 0.5;
        ind.macd.signal = 0.2;
        ind.macd.histogram = 0.3;
        ind.volume_spike = true;
        ind
    }

    #[test]
    fn enters_when_all_filters_pass() {
        let d = MeanReversion.evaluate_entry(&oversold(), &strategies::mean_reversion(), 100.0);
        assert!(d.enter, "{}", d.reason);
    }

    #[test]
    fn rsi_at_threshold_is_not_oversold() {
        let mut ind = oversold();
        ind.rsi.current = 25.0;
        assert!(!MeanReversion.evaluate_entry(&ind, &strategies::mean_reversion(), 100.0).enter);
    }

    #[test]
    fn optional_filters_can_be_disabled() {
        let mut ind = oversold();
        ind.macd.histogram = -0.1;
        ind.volume_spike = false;
        let strict = strategies::mean_reversion();
        assert!(!MeanReversion.evaluate_entry(&ind, &strict, 100.0).enter);

        let relaxed = StrategyConfig {
            macd_cross_needed: false,
            require_volume_spike: false,
            ..strict
        };
        assert!(MeanReversion.evaluate_entry(&ind, &relaxed, 100.0).enter);
    }
}
