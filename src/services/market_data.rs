//! Centralised market-data fan-out for **all** pipeline instances.
//! -----------------------------------------------------------------
//! ‣ WebSocket code lives in one place; pipelines only see `MarketEvent`s.
//! ‣ Events are published on a single `tokio::broadcast` topic; every
//!   pipeline subscribes independently and filters by symbol/interval.
//! ‣ Delivery is at-least-once: after a reconnect the exchange may resend
//!   the bar that was forming, which the candle aggregator tolerates.
//!
//! Usage from a pipeline task:
//! ```ignore
//! let mut rx = bus.subscribe();
//! while let Ok(ev) = rx.recv().await { /* feed pipeline */ }
//! ```
//! -----------------------------------------------------------------

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::connect_async;
use tungstenite::Message;

use crate::services::kraken::ws;
use crate::utils::errors::ApiError;
use crate::utils::retry::RetryPolicy;

const CAPACITY: usize = 1024; // ring-buffer for the topic

/// One OHLC update for the bar that opened at `ts`.
#[derive(Debug, Clone, PartialEq)]
pub struct BarEvent {
    pub symbol: String,
    pub interval_minutes: u32,
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickEvent {
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Bar(BarEvent),
    Tick(TickEvent),
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Bar(b) => &b.symbol,
            MarketEvent::Tick(t) => &t.symbol,
        }
    }
}

#[derive(Clone)]
pub struct MarketBus {
    tx: broadcast::Sender<MarketEvent>,
}

impl MarketBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of subscribers reached (0 when nobody listens).
    pub fn publish(&self, ev: MarketEvent) -> usize {
        self.tx.send(ev).unwrap_or(0)
    }
}

impl Default for MarketBus {
    fn default() -> Self {
        Self::new()
    }
}

// ================================================================
// Kraken connector – one socket for every symbol and interval
// ================================================================

const KRAKEN_WS_URL: &str = "wss://ws.kraken.com/v2";

pub struct KrakenFeed {
    symbols: Vec<String>,
    intervals: BTreeSet<u32>,
    policy: RetryPolicy,
}

impl KrakenFeed {
    pub fn new(symbols: Vec<String>, intervals: impl IntoIterator<Item = u32>) -> Self {
        Self {
            symbols,
            intervals: intervals.into_iter().collect(),
            policy: RetryPolicy::reconnect(),
        }
    }

    /// Connect, subscribe and forward frames until shutdown or until the
    /// reconnect budget is spent. The attempt counter resets after every
    /// successful connection.
    pub async fn run(self, bus: MarketBus, mut shutdown: watch::Receiver<bool>) {
        let mut failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.session(&bus, &mut shutdown, &mut failures).await {
                Ok(()) if *shutdown.borrow() => return,
                Ok(()) => log::warn!("[ws] kraken connection closed"),
                Err(e) => log::error!("[ws] kraken connection error: {e}"),
            }

            failures += 1;
            if failures >= self.policy.max_attempts {
                log::error!(
                    "[ws] giving up after {} reconnect attempts for {} symbols",
                    failures,
                    self.symbols.len()
                );
                return;
            }
            let delay = self.policy.delay(failures);
            log::info!("[ws] reconnecting in {:?} (attempt {}/{})", delay, failures, self.policy.max_attempts);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn session(
        &self,
        bus: &MarketBus,
        shutdown: &mut watch::Receiver<bool>,
        failures: &mut u32,
    ) -> Result<(), ApiError> {
        let (mut socket, _) = connect_async(KRAKEN_WS_URL).await?;
        log::info!("[ws] connected to kraken for {} symbols", self.symbols.len());
        *failures = 0;

        for interval in &self.intervals {
            let sub = ws::ohlc_subscription(&self.symbols, *interval);
            socket.send(Message::Text(sub.into())).await?;
        }
        socket
            .send(Message::Text(ws::trade_subscription(&self.symbols).into()))
            .await?;

        loop {
            tokio::select! {
                msg = socket.next() => {
                    let Some(msg) = msg else { return Ok(()) };
                    match msg? {
                        Message::Text(txt) => {
                            for ev in ws::parse_frame(&txt) {
                                bus.publish(ev);
                            }
                        }
                        Message::Ping(p) => socket.send(Message::Pong(p)).await?,
                        Message::Close(_) => return Ok(()),
                        _ => {}
                    }
                }
                _ = shutdown.changed() => {
                    let _ = socket.close(None).await;
                    return Ok(());
                }
            }
        }
    }
}
