// src/services/strategies/trend_follow.rs

use super::common::{EntryDecision, Strategy};
use crate::config::strategies::StrategyConfig;
use crate::services::indicators::IndicatorSnapshot;

/// Ride fresh upward momentum: RSI crossing the threshold with a rising,
/// positive MACD and calm volatility.
pub struct TrendFollowing;

impl Strategy for TrendFollowing {
    fn name(&self) -> &'static str {
        "trendFollowing"
    }

    fn evaluate_entry(&self, ind: &IndicatorSnapshot, cfg: &StrategyConfig, _price: f64) -> EntryDecision {
        let (prev, cur) = (ind.rsi.previous, ind.rsi.current);
        let t = cfg.rsi_threshold;
        if !(prev < t && t <= cur && cur < 70.0) {
            return EntryDecision::reject(format!(
                "trend following: no RSI cross through {t} ({prev:.2} -> {cur:.2})"
            ));
        }
        let m = &ind.macd;
        if !(m.value > m.signal && m.value > 0.0 && m.histogram > 0.0) {
            return EntryDecision::reject("trend following: MACD not trending up");
        }
        if !(m.short_ema > m.long_ema) {
            return EntryDecision::reject("trend following: short EMA below long EMA");
        }
        if ind.volatility_spike {
            return EntryDecision::reject("trend following: volatility spike");
        }
        EntryDecision::enter(format!("trend following: RSI {prev:.2} -> {cur:.2}, MACD trending up"))
    }
}
