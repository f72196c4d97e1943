//! Technical indicators over a closed-candle window.
//!
//! Everything here is pure and synchronous. A snapshot is rebuilt from the
//! full buffer on every closed bar; nothing is updated incrementally.

use serde::{Deserialize, Serialize};

use crate::config::strategies::StrategyConfig;
use crate::services::candles::Candle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RsiPair {
    pub current: f64,
    pub previous: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Macd {
    pub value: f64,
    pub signal: f64,
    pub histogram: f64,
    pub short_ema: f64,
    pub long_ema: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub rsi: RsiPair,
    pub macd: Macd,
    pub atr: f64,
    pub sma: f64,
    pub volume_spike: bool,
    pub volatility_spike: bool,
}

impl IndicatorSnapshot {
    /// ATR as a percentage of `price`.
    pub fn atr_percent(&self, price: f64) -> f64 {
        if price > 0.0 {
            self.atr / price * 100.0
        } else {
            0.0
        }
    }
}

/// Build a snapshot from `candles`, or `None` while the history is shorter
/// than `minimumRequiredCandles`.
pub fn compute(candles: &[Candle], cfg: &StrategyConfig) -> Option<IndicatorSnapshot> {
    if candles.is_empty() || candles.len() < cfg.minimum_required_candles {
        return None;
    }
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let n = closes.len();
    let p = cfg.rsi_period;

    let current = &closes[n.saturating_sub(p + 1)..];
    let previous = &closes[n.saturating_sub(p + 2)..n - 1];

    Some(IndicatorSnapshot {
        rsi: RsiPair {
            current: rsi(current, p),
            previous: rsi(previous, p),
        },
        macd: macd(
            &closes,
            cfg.short_ema_period,
            cfg.long_ema_period,
            cfg.signal_ema_period,
        ),
        atr: atr(candles, cfg.volatility_lookback),
        sma: sma(&closes, cfg.long_ema_period),
        volume_spike: volume_spike(candles, cfg.volume_spike_bar_count, cfg.volume_spike_factor),
        volatility_spike: volatility_spike(
            candles,
            cfg.volatility_lookback,
            cfg.volatility_threshold,
        ),
    })
}

/// Wilder RSI over `closes`. The first `period` changes seed simple averages,
/// any remaining changes are smoothed. Returns 0 for windows shorter than
/// `period + 1`, and 100 when the average loss is zero.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return 0.0;
    }
    let (mut gains, mut losses) = (0.0, 0.0);
    for w in closes[..=period].windows(2) {
        let change = w[1] - w[0];
        if change >= 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    let pf = period as f64;
    let mut avg_gain = gains / pf;
    let mut avg_loss = losses / pf;

    for w in closes[period..].windows(2) {
        let change = w[1] - w[0];
        avg_gain = (avg_gain * (pf - 1.0) + change.max(0.0)) / pf;
        avg_loss = (avg_loss * (pf - 1.0) + (-change).max(0.0)) / pf;
    }

    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// EMA series. Seeded with the mean of the first `period` values; the
/// recurrence starts at the last value of that seed window, so `n` inputs
/// produce `n - period + 2` points. Empty when `values.len() < period`.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;

    let mut out = Vec::with_capacity(values.len() - period + 2);
    out.push(seed);
    let mut prev = seed;
    for &v in &values[period - 1..] {
        prev = (v - prev) * k + prev;
        out.push(prev);
    }
    out
}

/// MACD on the aligned tails of the short and long EMAs. Zeroed when
/// `closes.len() < long + signal`.
pub fn macd(closes: &[f64], short: usize, long: usize, signal: usize) -> Macd {
    if closes.len() < long + signal {
        return Macd::default();
    }
    let short_ema = ema(closes, short);
    let long_ema = ema(closes, long);
    let (Some(&s_last), Some(&l_last)) = (short_ema.last(), long_ema.last()) else {
        return Macd::default();
    };
    let aligned = &short_ema[short_ema.len().saturating_sub(long_ema.len())..];

    let line: Vec<f64> = aligned
        .iter()
        .zip(long_ema.iter())
        .map(|(s, l)| s - l)
        .collect();
    let signal_line = ema(&line, signal);
    let (Some(&value), Some(&sig)) = (line.last(), signal_line.last()) else {
        return Macd::default();
    };

    Macd {
        value,
        signal: sig,
        histogram: value - sig,
        short_ema: s_last,
        long_ema: l_last,
    }
}

/// Simple mean of true ranges over the trailing `period` bars (each bar
/// needs its predecessor's close).
pub fn atr(candles: &[Candle], period: usize) -> f64 {
    let trs: Vec<f64> = candles
        .windows(2)
        .rev()
        .take(period)
        .map(|w| {
            let pc = w[0].close;
            let c = w[1];
            (c.high - c.low)
                .max((c.high - pc).abs())
                .max((c.low - pc).abs())
        })
        .collect();
    if trs.is_empty() {
        return 0.0;
    }
    trs.iter().sum::<f64>() / trs.len() as f64
}

/// Mean of the trailing `period` values.
pub fn sma(values: &[f64], period: usize) -> f64 {
    let tail = &values[values.len().saturating_sub(period)..];
    if tail.is_empty() {
        return 0.0;
    }
    tail.iter().sum::<f64>() / tail.len() as f64
}

/// Any bar of the trailing window trading more than `factor` × the window's
/// mean volume.
pub fn volume_spike(candles: &[Candle], bars: usize, factor: f64) -> bool {
    let recent = &candles[candles.len().saturating_sub(bars)..];
    if recent.is_empty() {
        return false;
    }
    let mean = recent.iter().map(|c| c.volume).sum::<f64>() / recent.len() as f64;
    recent.iter().any(|c| c.volume > mean * factor)
}

/// Latest bar's range above `threshold` × the trailing window's mean range.
pub fn volatility_spike(candles: &[Candle], lookback: usize, threshold: f64) -> bool {
    let recent = &candles[candles.len().saturating_sub(lookback)..];
    let Some(latest) = recent.last() else {
        return false;
    };
    let mean = recent.iter().map(|c| c.high - c.low).sum::<f64>() / recent.len() as f64;
    (latest.high - latest.low) > mean * threshold
}
