// src/services/strategies/exits.rs

//! Exit rules shared by every strategy kind. First match wins:
//! min hold → max hold → take-profit / stop-loss → trailing stop → hold.

use chrono::{DateTime, Utc};

use super::common::{ExitDecision, ExitReason};
use crate::config::strategies::StrategyConfig;
use crate::services::indicators::IndicatorSnapshot;
use crate::services::ledger::Position;

pub fn evaluate(
    pos: &Position,
    ind: &IndicatorSnapshot,
    cfg: &StrategyConfig,
    price: f64,
    peak_price: f64,
    now: DateTime<Utc>,
) -> ExitDecision {
    let held = pos.held_minutes(now);
    if held < cfg.min_hold_time_minutes {
        return ExitDecision::hold(ExitReason::MinHoldTime);
    }

    let pnl_pct = pos.pnl_pct(price);
    if held >= max_hold_minutes(ind, cfg, pnl_pct) {
        return ExitDecision::exit(ExitReason::HoldTime);
    }

    let (stop_loss, take_profit) = stop_levels(ind, cfg, price);
    if pnl_pct >= take_profit {
        return ExitDecision::exit(ExitReason::TakeProfit);
    }
    if pnl_pct <= -stop_loss {
        return ExitDecision::exit(ExitReason::StopLoss);
    }

    if let Some(trail) = cfg.trailing_stop_loss {
        if peak_price > 0.0 && (peak_price - price) / peak_price * 100.0 >= trail {
            return ExitDecision::exit(ExitReason::TrailingStop);
        }
    }

    ExitDecision::hold(ExitReason::Hold)
}

/// Effective hold ceiling in minutes.
pub fn max_hold_minutes(ind: &IndicatorSnapshot, cfg: &StrategyConfig, pnl_pct: f64) -> f64 {
    let mut max = cfg.max_hold_time_minutes;
    if pnl_pct > 3.0 {
        max *= 1.5;
    } else if pnl_pct > 0.0 && pnl_pct < 1.0 + cfg.round_trip_fee_pct() {
        // barely covering fees: cut it loose sooner
        max *= 0.7;
    }

    if cfg.adjust_hold_time_with_volatility {
        let mut m = 1.0;
        if ind.volatility_spike {
            m *= 0.7;
        }
        if ind.macd.value.abs() > ind.macd.signal.abs() * 2.0 {
            m *= 1.3;
        }
        if !ind.volume_spike {
            m *= 0.9;
        }
        max = (max * m).floor();
    }
    max
}

/// `(stopLossPct, takeProfitPct)`, widened to 3×/6× ATR% under dynamic stops.
pub fn stop_levels(ind: &IndicatorSnapshot, cfg: &StrategyConfig, price: f64) -> (f64, f64) {
    if !cfg.dynamic_stop_loss {
        return (cfg.stop_loss_pct, cfg.take_profit_pct);
    }
    let atr_pct = ind.atr_percent(price);
    (
        cfg.stop_loss_pct.max(3.0 * atr_pct),
        cfg.take_profit_pct.max(6.0 * atr_pct),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::strategies;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    fn pos(entry: f64) -> Position {
        Position {
            trade_id: Uuid::new_v4(),
            symbol: "BTC/USD".into(),
            entry_price: entry,
            quantity: 1.0,
            strategy_label: "test".into(),
            entry_time: t0(),
            peak_price: entry,
            last_price: entry,
        }
    }

    fn cfg() -> StrategyConfig {
        StrategyConfig {
            adjust_hold_time_with_volatility: false,
            dynamic_stop_loss: false,
            min_hold_time_minutes: 5.0,
            max_hold_time_minutes: 240.0,
            stop_loss_pct: 3.0,
            take_profit_pct: 6.0,
            trailing_stop_loss: None,
            ..strategies::mean_reversion()
        }
    }

    fn at(min: i64) -> DateTime<Utc> {
        t0() + Duration::minutes(min)
    }

    #[test]
    fn min_hold_beats_stop_loss() {
        let ind = IndicatorSnapshot::default();
        let d = evaluate(&pos(100.0), &ind, &cfg(), 90.0, 100.0, at(1));
        assert_eq!(d, ExitDecision::hold(ExitReason::MinHoldTime));
        // same drop after the floor exits
        let d = evaluate(&pos(100.0), &ind, &cfg(), 90.0, 100.0, at(6));
        assert_eq!(d, ExitDecision::exit(ExitReason::StopLoss));
    }

    #[test]
    fn hold_time_beats_take_profit() {
        let ind = IndicatorSnapshot::default();
        // +10% extends the ceiling to 360 min
        let d = evaluate(&pos(100.0), &ind, &cfg(), 110.0, 110.0, at(300));
        assert_eq!(d, ExitDecision::exit(ExitReason::TakeProfit));
        let d = evaluate(&pos(100.0), &ind, &cfg(), 110.0, 110.0, at(360));
        assert_eq!(d, ExitDecision::exit(ExitReason::HoldTime));
    }

    #[test]
    fn thin_profit_shortens_hold() {
        let ind = IndicatorSnapshot::default();
        let c = cfg();
        // 0.5% gain is below 1 + 0.8 fee threshold
        assert!((max_hold_minutes(&ind, &c, 0.5) - 168.0).abs() < 1e-9);
        assert_eq!(max_hold_minutes(&ind, &c, 2.0), 240.0);
        assert_eq!(max_hold_minutes(&ind, &c, -1.0), 240.0);
        assert_eq!(max_hold_minutes(&ind, &c, 3.5), 360.0);
    }

    #[test]
    fn volatility_multipliers_compose() {
        let c = StrategyConfig { adjust_hold_time_with_volatility: true, ..cfg() };
        let mut ind = IndicatorSnapshot::default();
        ind.volatility_spike = true;
        ind.macd.value = 3.0;
        ind.macd.signal = 1.0;
        ind.volume_spike = false;
        // 240 × 0.7 × 1.3 × 0.9 = 196.56
        assert_eq!(max_hold_minutes(&ind, &c, 2.0), 196.0);
        ind.volume_spike = true;
        ind.volatility_spike = false;
        assert_eq!(max_hold_minutes(&ind, &c, 2.0), 312.0);
    }

    #[test]
    fn dynamic_stops_floor_at_atr_multiples() {
        let c = StrategyConfig { dynamic_stop_loss: true, ..cfg() };
        let mut ind = IndicatorSnapshot::default();
        ind.atr = 2.0; // 2% of 100
        assert_eq!(stop_levels(&ind, &c, 100.0), (6.0, 12.0));
        ind.atr = 0.5;
        assert_eq!(stop_levels(&ind, &c, 100.0), (3.0, 6.0));
        // a -4% move is no longer a stop under 2% ATR
        ind.atr = 2.0;
        let d = evaluate(&pos(100.0), &ind, &c, 96.0, 100.0, at(10));
        assert_eq!(d, ExitDecision::hold(ExitReason::Hold));
    }

    #[test]
    fn trailing_stop_triggers_at_threshold() {
        let c = StrategyConfig {
            trailing_stop_loss: Some(3.5),
            stop_loss_pct: 50.0,
            take_profit_pct: 50.0,
            ..cfg()
        };
        let ind = IndicatorSnapshot::default();
        let p = pos(110.0);
        assert_eq!(
            evaluate(&p, &ind, &c, 115.81, 120.0, at(10)),
            ExitDecision::hold(ExitReason::Hold)
        );
        assert_eq!(
            evaluate(&p, &ind, &c, 115.8, 120.0, at(10)),
            ExitDecision::exit(ExitReason::TrailingStop)
        );
    }
}
