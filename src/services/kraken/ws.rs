// src/services/kraken/ws.rs

//!  Kraken WS v2 frames ⇢ `MarketEvent`s
//!
//!  * Builds the `ohlc` / `trade` subscribe requests
//!  * Decodes `ohlc` and `trade` channel updates
//!  * Everything else (heartbeat, status, method acks) decodes to nothing
//!
//!  Connection handling lives in `market_data::KrakenFeed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

use crate::services::market_data::{BarEvent, MarketEvent, TickEvent};

pub fn ohlc_subscription(symbols: &[String], interval_minutes: u32) -> String {
    serde_json::json!({
        "method": "subscribe",
        "params": {
            "channel":  "ohlc",
            "symbol":   symbols,
            "interval": interval_minutes,
            "snapshot": false
        }
    })
    .to_string()
}

pub fn trade_subscription(symbols: &[String]) -> String {
    serde_json::json!({
        "method": "subscribe",
        "params": {
            "channel":  "trade",
            "symbol":   symbols,
            "snapshot": false
        }
    })
    .to_string()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "channel", rename_all = "lowercase")]
enum Frame {
    Ohlc { data: Vec<OhlcEntry> },
    Trade { data: Vec<TradeEntry> },
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Deserialize)]
struct OhlcEntry {
    symbol: String,
    #[serde(deserialize_with = "num")]
    open: f64,
    #[serde(deserialize_with = "num")]
    high: f64,
    #[serde(deserialize_with = "num")]
    low: f64,
    #[serde(deserialize_with = "num")]
    close: f64,
    #[serde(deserialize_with = "num")]
    volume: f64,
    interval_begin: DateTime<Utc>,
    interval: u32,
}

#[derive(Debug, Deserialize)]
struct TradeEntry {
    symbol: String,
    #[serde(deserialize_with = "num")]
    price: f64,
    #[serde(deserialize_with = "num")]
    qty: f64,
    timestamp: DateTime<Utc>,
}

/// Kraken sends some numbers as strings depending on channel and precision.
pub(crate) fn num<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        N(f64),
        S(String),
    }
    match NumOrStr::deserialize(d)? {
        NumOrStr::N(n) => Ok(n),
        NumOrStr::S(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Decode one text frame. Unparseable or uninteresting frames yield nothing.
pub fn parse_frame(txt: &str) -> Vec<MarketEvent> {
    let frame = match serde_json::from_str::<Frame>(txt) {
        Ok(f) => f,
        Err(e) => {
            // method acks carry no `channel` and land here too
            log::debug!("[ws] skipping frame: {e}");
            return Vec::new();
        }
    };
    match frame {
        Frame::Ohlc { data } => data
            .into_iter()
            .map(|o| {
                MarketEvent::Bar(BarEvent {
                    symbol: o.symbol,
                    interval_minutes: o.interval,
                    ts: o.interval_begin,
                    open: o.open,
                    high: o.high,
                    low: o.low,
                    close: o.close,
                    volume: o.volume,
                })
            })
            .collect(),
        Frame::Trade { data } => data
            .into_iter()
            .map(|t| {
                MarketEvent::Tick(TickEvent {
                    symbol: t.symbol,
                    price: t.price,
                    quantity: t.qty,
                    ts: t.timestamp,
                })
            })
            .collect(),
        Frame::Ignored => Vec::new(),
    }
}
