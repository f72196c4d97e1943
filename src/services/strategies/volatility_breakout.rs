// src/services/strategies/volatility_breakout.rs

use super::common::{EntryDecision, Strategy};
use crate::config::strategies::StrategyConfig;
use crate::services::indicators::IndicatorSnapshot;

/// Range expansion on heavy volume while RSI is still neutral.
pub struct VolatilityBreakout;

impl Strategy for VolatilityBreakout {
    fn name(&self) -> &'static str {
        "volatilityBreakout"
    }

    fn evaluate_entry(&self, ind: &IndicatorSnapshot, cfg: &StrategyConfig, price: f64) -> EntryDecision {
        if !(ind.volume_spike && ind.volatility_spike) {
            return EntryDecision::reject("volatility breakout: needs volume and volatility spike");
        }
        let rsi = ind.rsi.current;
        if !(rsi > 40.0 && rsi < 60.0) {
            return EntryDecision::reject(format!("volatility breakout: RSI {rsi:.2} outside (40, 60)"));
        }
        let atr_pct = ind.atr_percent(price);
        if !(atr_pct > cfg.min_atr_percent) {
            return EntryDecision::reject(format!(
                "volatility breakout: ATR {atr_pct:.2}% not above {}%",
                cfg.min_atr_percent
            ));
        }
        EntryDecision::enter(format!("volatility breakout: ATR {atr_pct:.2}%, volume confirmed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::strategies;

    fn breakout() -> IndicatorSnapshot {
        let mut ind = IndicatorSnapshot::default();
        ind.volume_spike = true;
        ind.volatility_spike = true;
        ind.rsi.current = 52.0;
        ind.atr = 2.0;
        ind
    }

    #[test]
    fn enters_on_wide_range_with_neutral_rsi() {
        let d = VolatilityBreakout.evaluate_entry(&breakout(), &strategies::volatility_breakout(), 100.0);
        assert!(d.enter, "{}", d.reason);
    }

    #[test]
    fn rejects_each_missing_condition() {
        let cfg = strategies::volatility_breakout();

        let mut ind = breakout();
        ind.volatility_spike = false;
        assert!(!VolatilityBreakout.evaluate_entry(&ind, &cfg, 100.0).enter);

        let mut ind = breakout();
        ind.rsi.current = 60.0;
        assert!(!VolatilityBreakout.evaluate_entry(&ind, &cfg, 100.0).enter);

        // 1.5% floor
        let mut ind = breakout();
        ind.atr = 1.5;
        assert!(!VolatilityBreakout.evaluate_entry(&ind, &cfg, 100.0).enter);
    }
}
