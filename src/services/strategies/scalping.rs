// src/services/strategies/scalping.rs

use super::common::{EntryDecision, Strategy};
use crate::config::strategies::StrategyConfig;
use crate::services::indicators::IndicatorSnapshot;

pub struct Scalping;

impl Strategy for Scalping {
    fn name(&self) -> &'static str {
        "scalping"
    }

    fn evaluate_entry(&self, ind: &IndicatorSnapshot, cfg: &StrategyConfig, price: f64) -> EntryDecision {
        let rsi = ind.rsi.current;
        if !(rsi > cfg.rsi_threshold) {
            return EntryDecision::reject(format!("scalping: RSI {rsi:.2} not above {}", cfg.rsi_threshold));
        }
        if !(ind.macd.value > ind.macd.signal && ind.macd.value > 0.0) {
            return EntryDecision::reject("scalping: no positive MACD momentum");
        }
        if !ind.volume_spike {
            return EntryDecision::reject("scalping: no volume spike");
        }
        let atr_pct = ind.atr_percent(price);
        if !(atr_pct > 0.1 && atr_pct < 1.0) {
            return EntryDecision::reject(format!("scalping: ATR {atr_pct:.3}% outside (0.1, 1.0)"));
        }
        EntryDecision::enter(format!("scalping: RSI {rsi:.2}, volume spike, ATR {atr_pct:.3}%"))
    }
}
