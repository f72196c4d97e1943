//! Per-symbol candle aggregation.
//!
//! Each symbol keeps a bounded history of *closed* bars plus the single bar
//! that is still forming. A bar closes when an event with a later bar-open
//! timestamp arrives; only then is the history (and anything derived from it)
//! allowed to change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::services::market_data::BarEvent;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar-open instant
    pub ts:     DateTime<Utc>,
    pub open:   f64,
    pub high:   f64,
    pub low:    f64,
    pub close:  f64,
    pub volume: f64,
}

impl From<&BarEvent> for Candle {
    fn from(ev: &BarEvent) -> Self {
        Candle {
            ts: ev.ts,
            open: ev.open,
            high: ev.high,
            low: ev.low,
            close: ev.close,
            volume: ev.volume,
        }
    }
}

/// FIFO of closed candles, strictly increasing by `ts`.
#[derive(Debug, Clone)]
pub struct CandleBuffer {
    capacity: usize,
    candles: Vec<Candle>,
}

impl CandleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            candles: Vec::with_capacity(capacity.max(1) + 1),
        }
    }

    /// Seed from history; rows out of order or duplicated are dropped, and only
    /// the newest `capacity` survive.
    pub fn seeded(capacity: usize, history: impl IntoIterator<Item = Candle>) -> Self {
        let mut buf = Self::new(capacity);
        for c in history {
            buf.push(c);
        }
        buf
    }

    /// Append a closed candle, evicting the oldest when over capacity.
    /// Returns `false` (and does nothing) if `c` is not newer than the tail.
    pub fn push(&mut self, c: Candle) -> bool {
        if let Some(last) = self.candles.last() {
            if c.ts <= last.ts {
                return false;
            }
        }
        self.candles.push(c);
        if self.candles.len() > self.capacity {
            let excess = self.candles.len() - self.capacity;
            self.candles.drain(..excess);
        }
        true
    }

    pub fn as_slice(&self) -> &[Candle] {
        &self.candles
    }
    pub fn len(&self) -> usize {
        self.candles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }
}

/// What a bar event did to a symbol's state.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Same bar, same values (redelivery)
    Unchanged,
    /// Same bar-open timestamp, new high/low/close/volume; or the very first
    /// bar seen for the symbol
    Updated,
    /// The forming bar was closed and appended; a new one started
    Closed(Candle),
    /// Timestamp older than the forming bar; dropped
    Stale,
}

#[derive(Debug, Clone)]
struct SymbolCandles {
    buffer: CandleBuffer,
    forming: Option<Candle>,
    last_price: Option<f64>,
}

/// Aggregates bar events for every symbol of one pipeline instance.
#[derive(Debug, Clone)]
pub struct CandleAggregator {
    capacity: usize,
    symbols: HashMap<String, SymbolCandles>,
}

impl CandleAggregator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            symbols: HashMap::new(),
        }
    }

    /// Install bootstrap history. The newest row is treated as the forming bar.
    pub fn seed(&mut self, symbol: &str, mut history: Vec<Candle>) {
        history.sort_by_key(|c| c.ts);
        history.dedup_by_key(|c| c.ts);
        let forming = history.pop();
        let state = SymbolCandles {
            buffer: CandleBuffer::seeded(self.capacity, history),
            last_price: forming.map(|c| c.close),
            forming,
        };
        self.symbols.insert(symbol.to_string(), state);
    }

    pub fn ingest(&mut self, ev: &BarEvent) -> IngestOutcome {
        let capacity = self.capacity;
        let state = self
            .symbols
            .entry(ev.symbol.clone())
            .or_insert_with(|| SymbolCandles {
                buffer: CandleBuffer::new(capacity),
                forming: None,
                last_price: None,
            });
        let candle = Candle::from(ev);

        let Some(forming) = state.forming else {
            if state.buffer.last().map_or(false, |l| candle.ts <= l.ts) {
                return IngestOutcome::Stale;
            }
            state.forming = Some(candle);
            state.last_price = Some(candle.close);
            return IngestOutcome::Updated;
        };

        if candle.ts > forming.ts {
            state.buffer.push(forming);
            state.forming = Some(candle);
            state.last_price = Some(candle.close);
            IngestOutcome::Closed(forming)
        } else if candle.ts == forming.ts {
            if candle.high != forming.high
                || candle.low != forming.low
                || candle.close != forming.close
                || candle.volume != forming.volume
            {
                state.forming = Some(candle);
                state.last_price = Some(candle.close);
                IngestOutcome::Updated
            } else {
                IngestOutcome::Unchanged
            }
        } else {
            IngestOutcome::Stale
        }
    }

    /// Trade ticks only move the mark price; the buffer is untouched.
    pub fn record_tick(&mut self, symbol: &str, price: f64) {
        if let Some(state) = self.symbols.get_mut(symbol) {
            state.last_price = Some(price);
        } else {
            self.symbols.insert(
                symbol.to_string(),
                SymbolCandles {
                    buffer: CandleBuffer::new(self.capacity),
                    forming: None,
                    last_price: Some(price),
                },
            );
        }
    }

    pub fn history(&self, symbol: &str) -> &[Candle] {
        self.symbols
            .get(symbol)
            .map(|s| s.buffer.as_slice())
            .unwrap_or(&[])
    }

    pub fn forming(&self, symbol: &str) -> Option<Candle> {
        self.symbols.get(symbol).and_then(|s| s.forming)
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.symbols.get(symbol).and_then(|s| s.last_price)
    }
}
