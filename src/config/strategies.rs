//! Strategy configurations.
//!
//! One `StrategyConfig` fully determines one pipeline instance. Configs are
//! loaded once (preset or JSON file), validated, then shared read-only behind
//! an `Arc`.

use serde::{Deserialize, Serialize};
use std::{fmt, path::Path};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse strategy configs: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("config {id}: {reason}")]
    Invalid { id: String, reason: String },
    #[error("unknown preset '{0}'")]
    UnknownPreset(String),
}

/// Strategy selector. Unrecognised names are kept as `Invalid` so the
/// pipeline can still run (and reject every entry) instead of failing to load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StrategyKind {
    MeanReversion,
    TrendFollowing,
    Scalping,
    VolatilityBreakout,
    Invalid(String),
}

impl From<String> for StrategyKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "meanReversion" | "mean_reversion" => StrategyKind::MeanReversion,
            "trendFollowing" | "trend_following" | "trend_follow" => StrategyKind::TrendFollowing,
            "scalping" => StrategyKind::Scalping,
            "volatilityBreakout" | "volatility_breakout" => StrategyKind::VolatilityBreakout,
            _ => StrategyKind::Invalid(s),
        }
    }
}

impl From<StrategyKind> for String {
    fn from(k: StrategyKind) -> Self {
        k.to_string()
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::MeanReversion => f.write_str("meanReversion"),
            StrategyKind::TrendFollowing => f.write_str("trendFollowing"),
            StrategyKind::Scalping => f.write_str("scalping"),
            StrategyKind::VolatilityBreakout => f.write_str("volatilityBreakout"),
            StrategyKind::Invalid(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyConfig {
    /// Configuration identity; also the key of its rows in the trade store
    pub id: String,
    pub strategy_type: StrategyKind,

    // entry filters
    pub rsi_threshold: f64,
    pub macd_cross_needed: bool,
    #[serde(alias = "allowVolumeSpikes")]
    pub require_volume_spike: bool,

    // exits
    pub dynamic_stop_loss: bool,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    #[serde(default)]
    pub trailing_stop_loss: Option<f64>,
    pub max_hold_time_minutes: f64,
    pub min_hold_time_minutes: f64,
    pub adjust_hold_time_with_volatility: bool,

    // indicator windows
    pub interval_minutes: u32,
    pub rsi_period: usize,
    pub long_ema_period: usize,
    pub short_ema_period: usize,
    pub signal_ema_period: usize,
    pub volume_spike_bar_count: usize,
    pub volume_spike_factor: f64,
    pub volatility_lookback: usize,
    pub volatility_threshold: f64,
    pub minimum_required_candles: usize,

    // sizing
    #[serde(alias = "max_position_size")]
    pub max_position_size: f64,
    #[serde(alias = "max_positions")]
    pub max_positions: usize,
    pub max_volatility: f64,
    pub min_atr_percent: f64,
    #[serde(default = "d_risk")]
    pub risk_per_trade: f64,
    #[serde(default = "d_fee")]
    pub fee_rate: f64,
    #[serde(default = "d_balance")]
    pub trade_balance: f64,

    /// Send real market orders (otherwise simulated fills only)
    #[serde(default, alias = "tradeOnKraken")]
    pub live: bool,
}
fn d_risk() -> f64 {
    0.04
}
fn d_fee() -> f64 {
    0.004
}
fn d_balance() -> f64 {
    10_000.0
}

impl StrategyConfig {
    /// Closed candles kept per symbol.
    pub fn buffer_capacity(&self) -> usize {
        (self.long_ema_period * 4).max(self.minimum_required_candles)
    }

    /// Entry + exit fee in percent of notional.
    pub fn round_trip_fee_pct(&self) -> f64 {
        2.0 * self.fee_rate * 100.0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let bad = |reason: &str| {
            Err(ConfigError::Invalid {
                id: self.id.clone(),
                reason: reason.to_string(),
            })
        };
        if self.id.trim().is_empty() {
            return bad("id must not be empty");
        }
        if self.interval_minutes == 0 {
            return bad("intervalMinutes must be > 0");
        }
        if self.rsi_period == 0
            || self.short_ema_period == 0
            || self.long_ema_period == 0
            || self.signal_ema_period == 0
            || self.volume_spike_bar_count == 0
            || self.volatility_lookback == 0
        {
            return bad("indicator periods must be > 0");
        }
        if self.short_ema_period >= self.long_ema_period {
            return bad("shortEmaPeriod must be below longEmaPeriod");
        }
        if !(self.stop_loss_pct > 0.0) || !(self.take_profit_pct > 0.0) {
            return bad("stopLossPct and takeProfitPct must be > 0");
        }
        if let Some(t) = self.trailing_stop_loss {
            if !(t > 0.0 && t < 100.0) {
                return bad("trailingStopLoss must be within (0, 100)");
            }
        }
        if self.max_positions == 0 {
            return bad("maxPositions must be > 0");
        }
        if !(self.max_position_size > 0.0 && self.max_position_size <= 1.0) {
            return bad("maxPositionSize must be within (0, 1]");
        }
        if self.min_hold_time_minutes > self.max_hold_time_minutes {
            return bad("minHoldTimeMinutes exceeds maxHoldTimeMinutes");
        }
        if !(self.fee_rate >= 0.0) || !(self.risk_per_trade > 0.0) {
            return bad("feeRate must be >= 0 and riskPerTrade > 0");
        }
        if let StrategyKind::Invalid(name) = &self.strategy_type {
            log::warn!("[{}] unknown strategy type '{name}', entries will be rejected", self.id);
        }
        Ok(())
    }
}

/// Read an array of configs from a JSON file.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Vec<StrategyConfig>, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let cfgs: Vec<StrategyConfig> = serde_json::from_str(&raw)?;
    for c in &cfgs {
        c.validate()?;
    }
    Ok(cfgs)
}

/// Look up a built-in preset by name.
pub fn preset(name: &str) -> Result<StrategyConfig, ConfigError> {
    presets()
        .into_iter()
        .find(|c| c.id == name)
        .ok_or_else(|| ConfigError::UnknownPreset(name.to_string()))
}

/// The five configurations the engine ships with.
pub fn presets() -> Vec<StrategyConfig> {
    vec![
        mean_reversion(),
        trend_following(),
        long_trend_following(),
        scalping(),
        volatility_breakout(),
    ]
}

pub fn mean_reversion() -> StrategyConfig {
    StrategyConfig {
        id: "mean-reversion".into(),
        strategy_type: StrategyKind::MeanReversion,
        rsi_threshold: 25.0, // extreme oversold for crypto
        macd_cross_needed: true,
        require_volume_spike: true,
        dynamic_stop_loss: false,
        stop_loss_pct: 3.0,
        take_profit_pct: 6.0,
        trailing_stop_loss: None,
        max_hold_time_minutes: 240.0,
        min_hold_time_minutes: 5.0,
        adjust_hold_time_with_volatility: true,
        interval_minutes: 5,
        rsi_period: 14,
        long_ema_period: 26,
        short_ema_period: 12,
        signal_ema_period: 9,
        volume_spike_bar_count: 20,
        volume_spike_factor: 2.0,
        volatility_lookback: 20,
        volatility_threshold: 2.0,
        minimum_required_candles: 26,
        max_position_size: 0.05,
        max_positions: 5,
        max_volatility: 3.0,
        min_atr_percent: 0.8,
        risk_per_trade: d_risk(),
        fee_rate: d_fee(),
        trade_balance: d_balance(),
        live: false,
    }
}

pub fn trend_following() -> StrategyConfig {
    StrategyConfig {
        id: "trend-following".into(),
        strategy_type: StrategyKind::TrendFollowing,
        rsi_threshold: 45.0, // momentum building
        macd_cross_needed: true,
        require_volume_spike: true,
        dynamic_stop_loss: true,
        stop_loss_pct: 1.5,
        take_profit_pct: 4.5,
        trailing_stop_loss: None,
        max_hold_time_minutes: 1440.0,
        min_hold_time_minutes: 30.0,
        adjust_hold_time_with_volatility: false,
        interval_minutes: 15,
        rsi_period: 14,
        long_ema_period: 50,
        short_ema_period: 20,
        signal_ema_period: 9,
        volume_spike_bar_count: 30,
        volume_spike_factor: 1.3,
        volatility_lookback: 50,
        volatility_threshold: 1.2,
        minimum_required_candles: 50,
        max_position_size: 0.06,
        max_positions: 4,
        max_volatility: 1.5,
        min_atr_percent: 0.3,
        risk_per_trade: d_risk(),
        fee_rate: d_fee(),
        trade_balance: d_balance(),
        live: false,
    }
}

pub fn long_trend_following() -> StrategyConfig {
    StrategyConfig {
        id: "long-trend-following".into(),
        stop_loss_pct: 3.5,
        take_profit_pct: 10.5,
        trailing_stop_loss: Some(3.5),
        interval_minutes: 30,
        long_ema_period: 100,
        short_ema_period: 30,
        max_volatility: 2.5,
        minimum_required_candles: 100,
        ..trend_following()
    }
}

pub fn scalping() -> StrategyConfig {
    StrategyConfig {
        id: "scalping".into(),
        strategy_type: StrategyKind::Scalping,
        rsi_threshold: 60.0,
        macd_cross_needed: true,
        require_volume_spike: true,
        dynamic_stop_loss: true,
        stop_loss_pct: 1.0,
        take_profit_pct: 2.0,
        trailing_stop_loss: None,
        max_hold_time_minutes: 30.0,
        min_hold_time_minutes: 1.0,
        adjust_hold_time_with_volatility: true,
        interval_minutes: 1,
        rsi_period: 7,
        long_ema_period: 13,
        short_ema_period: 8,
        signal_ema_period: 5,
        volume_spike_bar_count: 10,
        volume_spike_factor: 1.8,
        volatility_lookback: 20,
        volatility_threshold: 0.8,
        minimum_required_candles: 13,
        max_position_size: 0.03,
        max_positions: 10,
        max_volatility: 1.5,
        min_atr_percent: 0.1,
        risk_per_trade: d_risk(),
        fee_rate: d_fee(),
        trade_balance: d_balance(),
        live: false,
    }
}

pub fn volatility_breakout() -> StrategyConfig {
    StrategyConfig {
        id: "volatility-breakout".into(),
        strategy_type: StrategyKind::VolatilityBreakout,
        rsi_threshold: 50.0, // filter only
        macd_cross_needed: false,
        require_volume_spike: true,
        dynamic_stop_loss: true,
        stop_loss_pct: 3.5,
        take_profit_pct: 10.5,
        trailing_stop_loss: None,
        max_hold_time_minutes: 360.0,
        min_hold_time_minutes: 5.0,
        adjust_hold_time_with_volatility: true,
        interval_minutes: 15,
        rsi_period: 14,
        long_ema_period: 26,
        short_ema_period: 12,
        signal_ema_period: 9,
        volume_spike_bar_count: 20,
        volume_spike_factor: 2.5,
        volatility_lookback: 30,
        volatility_threshold: 2.5,
        minimum_required_candles: 26,
        max_position_size: 0.05,
        max_positions: 6,
        max_volatility: 4.0,
        min_atr_percent: 1.5,
        risk_per_trade: d_risk(),
        fee_rate: d_fee(),
        trade_balance: d_balance(),
        live: false,
    }
}
