// src/services/strategies/common.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::config::strategies::{StrategyConfig, StrategyKind};
use crate::services::indicators::IndicatorSnapshot;
use crate::services::ledger::Position;

use super::{exits, mean_reversion, scalping, trend_follow, volatility_breakout};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryDecision {
    pub enter: bool,
    pub reason: String,
}

impl EntryDecision {
    pub fn enter(reason: impl Into<String>) -> Self {
        Self { enter: true, reason: reason.into() }
    }
    pub fn reject(reason: impl Into<String>) -> Self {
        Self { enter: false, reason: reason.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExitReason {
    HoldTime,
    TakeProfit,
    StopLoss,
    TrailingStop,
    /// Still inside the minimum hold window
    MinHoldTime,
    Hold,
    Shutdown,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::HoldTime => "holdTime",
            ExitReason::TakeProfit => "takeProfit",
            ExitReason::StopLoss => "stopLoss",
            ExitReason::TrailingStop => "trailingStop",
            ExitReason::MinHoldTime => "minHoldTime",
            ExitReason::Hold => "hold",
            ExitReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitDecision {
    pub exit: bool,
    pub reason: ExitReason,
}

impl ExitDecision {
    pub fn exit(reason: ExitReason) -> Self {
        Self { exit: true, reason }
    }
    pub fn hold(reason: ExitReason) -> Self {
        Self { exit: false, reason }
    }
}

/// Entry/exit contract shared by every strategy kind. Implementations are
/// pure: same inputs, same decision.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate_entry(&self, ind: &IndicatorSnapshot, cfg: &StrategyConfig, price: f64) -> EntryDecision;

    fn evaluate_exit(
        &self,
        pos: &Position,
        ind: &IndicatorSnapshot,
        cfg: &StrategyConfig,
        price: f64,
        peak_price: f64,
        now: DateTime<Utc>,
    ) -> ExitDecision {
        exits::evaluate(pos, ind, cfg, price, peak_price, now)
    }
}

/// Kinds the engine cannot trade. Never enters; exits still follow the
/// common rules so restored positions can be wound down.
pub struct InvalidStrategy;

impl Strategy for InvalidStrategy {
    fn name(&self) -> &'static str {
        "invalid"
    }

    fn evaluate_entry(&self, _: &IndicatorSnapshot, _: &StrategyConfig, _: f64) -> EntryDecision {
        EntryDecision::reject("invalid strategy")
    }
}

/// Resolve the evaluator once, at pipeline construction.
pub fn for_kind(kind: &StrategyKind) -> Box<dyn Strategy> {
    match kind {
        StrategyKind::MeanReversion => Box::new(mean_reversion::MeanReversion),
        StrategyKind::TrendFollowing => Box::new(trend_follow::TrendFollowing),
        StrategyKind::Scalping => Box::new(scalping::Scalping),
        StrategyKind::VolatilityBreakout => Box::new(volatility_breakout::VolatilityBreakout),
        StrategyKind::Invalid(_) => Box::new(InvalidStrategy),
    }
}
