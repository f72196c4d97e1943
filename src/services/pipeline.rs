//! One strategy configuration's streaming state machine:
//! candles → indicators → decisions → ledger.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::increment_counter;
use tokio::sync::{broadcast, watch};

use crate::config::strategies::StrategyConfig;
use crate::db::store::TradeStore;
use crate::services::bootstrap::{self, HistorySource};
use crate::services::candles::{Candle, CandleAggregator, IngestOutcome};
use crate::services::indicators::{self, IndicatorSnapshot};
use crate::services::ledger::{CloseOutcome, OpenOutcome, Portfolio, PositionLedger};
use crate::services::market_data::{BarEvent, MarketEvent, TickEvent};
use crate::services::trading_engine::OrderClient;
use crate::utils::errors::EngineError;

pub struct Pipeline {
    config: Arc<StrategyConfig>,
    symbols: HashSet<String>,
    candles: CandleAggregator,
    indicators: HashMap<String, IndicatorSnapshot>,
    ledger: PositionLedger,
}

impl Pipeline {
    pub fn new(
        config: Arc<StrategyConfig>,
        symbols: impl IntoIterator<Item = String>,
        balance: f64,
        store: Arc<dyn TradeStore>,
        orders: Option<Arc<dyn OrderClient>>,
    ) -> Self {
        Self {
            candles: CandleAggregator::new(config.buffer_capacity()),
            symbols: symbols.into_iter().collect(),
            indicators: HashMap::new(),
            ledger: PositionLedger::new(config.clone(), balance, store, orders),
            config,
        }
    }

    /// Bootstrap history, restore open trades, and return a pipeline ready
    /// to consume events.
    pub async fn start(
        config: Arc<StrategyConfig>,
        symbols: Vec<String>,
        history: &dyn HistorySource,
        store: Arc<dyn TradeStore>,
        orders: Option<Arc<dyn OrderClient>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let boot = bootstrap::bootstrap(history, &config, &symbols).await?;

        let mut pipeline = Self::new(config.clone(), symbols, boot.balance, store.clone(), orders);
        for (symbol, candles) in boot.history {
            pipeline.seed(&symbol, candles);
        }

        let rows = store
            .open_trades(&config.id)
            .await
            .map_err(|source| EngineError::Recovery {
                config_id: config.id.clone(),
                source,
            })?;
        let restored = pipeline.ledger.restore(rows);
        if restored > 0 {
            log::info!("[{}] restored {restored} open positions", config.id);
            let now = Utc::now();
            let marks: Vec<(String, f64)> = pipeline
                .ledger
                .positions()
                .filter_map(|p| pipeline.candles.last_price(&p.symbol).map(|px| (p.symbol.clone(), px)))
                .collect();
            for (symbol, price) in marks {
                pipeline.ledger.mark_price(&symbol, price, now).await;
            }
        }
        Ok(pipeline)
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn indicators(&self, symbol: &str) -> Option<&IndicatorSnapshot> {
        self.indicators.get(symbol)
    }

    pub fn history(&self, symbol: &str) -> &[Candle] {
        self.candles.history(symbol)
    }

    pub fn portfolio(&self) -> Portfolio {
        self.ledger.portfolio()
    }

    pub fn seed(&mut self, symbol: &str, history: Vec<Candle>) {
        self.candles.seed(symbol, history);
        self.recompute(symbol);
    }

    /// Replace the snapshot from the closed history; a short history leaves
    /// the previous snapshot (or none) in place.
    fn recompute(&mut self, symbol: &str) {
        if let Some(snap) = indicators::compute(self.candles.history(symbol), &self.config) {
            self.indicators.insert(symbol.to_string(), snap);
        }
    }

    pub async fn on_event(&mut self, ev: &MarketEvent, now: DateTime<Utc>) {
        match ev {
            MarketEvent::Bar(b) => self.on_bar_event(b, now).await,
            MarketEvent::Tick(t) => self.on_tick_event(t, now).await,
        }
    }

    pub async fn on_bar_event(&mut self, ev: &BarEvent, now: DateTime<Utc>) {
        if ev.interval_minutes != self.config.interval_minutes || !self.symbols.contains(&ev.symbol) {
            return;
        }
        match self.candles.ingest(ev) {
            IngestOutcome::Closed(_) => {
                increment_counter!("engine_bars_closed_total", "config" => self.config.id.clone());
                self.recompute(&ev.symbol);
                self.ledger.flush_unreconciled().await;
                // the event that closed the bar carries the current price
                self.decide(&ev.symbol, ev.close, now).await;
            }
            IngestOutcome::Updated => {
                if let Some(price) = self.candles.last_price(&ev.symbol) {
                    self.observe_price(&ev.symbol, price, now).await;
                }
            }
            IngestOutcome::Unchanged | IngestOutcome::Stale => {}
        }
    }

    pub async fn on_tick_event(&mut self, ev: &TickEvent, now: DateTime<Utc>) {
        if !self.symbols.contains(&ev.symbol) || !(ev.price.is_finite() && ev.price > 0.0) {
            return;
        }
        self.candles.record_tick(&ev.symbol, ev.price);
        self.observe_price(&ev.symbol, ev.price, now).await;
    }

    /// Closed-bar decision at the current price: exit check (and mark) for a
    /// held symbol, entry check otherwise.
    async fn decide(&mut self, symbol: &str, price: f64, now: DateTime<Utc>) {
        if self.ledger.position(symbol).is_some() {
            self.observe_price(symbol, price, now).await;
            return;
        }
        let ind = self.indicators.get(symbol);
        match self.ledger.try_open(symbol, ind, price, now).await {
            Ok(OpenOutcome::Opened(_)) | Ok(OpenOutcome::Rejected(_)) => {}
            Err(e) => log::error!("{e}"),
        }
    }

    /// Mark-to-market path: exit if due, else refresh the persisted mark.
    async fn observe_price(&mut self, symbol: &str, price: f64, now: DateTime<Utc>) {
        let ind = self.indicators.get(symbol);
        match self.ledger.try_close(symbol, ind, price, now).await {
            CloseOutcome::Held(reason) => {
                log::debug!("[{}][{symbol}] holding: {reason}", self.config.id);
                self.ledger.mark_price(symbol, price, now).await;
            }
            CloseOutcome::Closed(_) | CloseOutcome::NoPosition => {}
        }
    }

    /// Reconcile, liquidate, reconcile again. Returns the final portfolio.
    pub async fn shutdown(&mut self, now: DateTime<Utc>) -> Portfolio {
        self.ledger.flush_unreconciled().await;
        let closed = self.ledger.close_all(now).await;
        let pending = self.ledger.flush_unreconciled().await;
        let p = self.ledger.portfolio();
        log::info!(
            "[{}] shut down: {} positions liquidated, balance {:.2}",
            self.config.id,
            closed.len(),
            p.balance
        );
        if pending > 0 {
            for u in self.ledger.unreconciled() {
                log::error!(
                    "[{}][{}] trade {} left unreconciled at shutdown: {:?}",
                    self.config.id,
                    u.symbol,
                    u.trade_id,
                    u.update
                );
            }
        }
        p
    }

    /// Consume the bus until shutdown or until the bus closes. An event that
    /// is being processed always completes before the loop exits.
    pub async fn run(
        mut self,
        mut rx: broadcast::Receiver<MarketEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Portfolio {
        log::info!("[{}] pipeline running on {} symbols", self.config.id, self.symbols.len());
        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                msg = rx.recv() => match msg {
                    Ok(ev) => self.on_event(&ev, Utc::now()).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[{}] market bus lagged, {n} events skipped", self.config.id);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        log::warn!("[{}] market bus closed", self.config.id);
                        break;
                    }
                },
            }
        }
        self.shutdown(Utc::now()).await
    }
}
