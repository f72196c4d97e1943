//! Position ledger for one pipeline instance.
//!
//! Owns every open position of a strategy configuration together with the
//! account balance. State changes follow the store: an open is installed
//! only after its row is written, a close is applied locally first and,
//! when the row cannot be updated, kept in an unreconciled queue that is
//! retried until the store accepts it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::{gauge, increment_counter};
use serde::Serialize;
use uuid::Uuid;

use crate::config::strategies::StrategyConfig;
use crate::db::models::{OpenTradeRecord, OpenTradeRow, TradeUpdate};
use crate::db::store::TradeStore;
use crate::services::indicators::IndicatorSnapshot;
use crate::services::strategies::common::{self, ExitReason, Strategy};
use crate::services::trading_engine::{OrderClient, Side};
use crate::utils::errors::LedgerError;

/// Persisted marks are throttled unless the peak moves.
const MARK_PERSIST_INTERVAL_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub trade_id: Uuid,
    pub symbol: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub strategy_label: String,
    pub entry_time: DateTime<Utc>,
    /// High-water mark of observed prices since entry
    pub peak_price: f64,
    pub last_price: f64,
}

impl Position {
    pub fn pnl_pct(&self, price: f64) -> f64 {
        if self.entry_price > 0.0 {
            (price - self.entry_price) / self.entry_price * 100.0
        } else {
            0.0
        }
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.quantity
    }

    pub fn held_minutes(&self, now: DateTime<Utc>) -> f64 {
        (now - self.entry_time).num_milliseconds() as f64 / 60_000.0
    }

    pub fn notional(&self) -> f64 {
        self.entry_price * self.quantity
    }

    /// Record a price; returns `true` when the peak moved up.
    pub fn observe(&mut self, price: f64) -> bool {
        self.last_price = price;
        if price > self.peak_price {
            self.peak_price = price;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Portfolio {
    pub balance: f64,
    pub available_balance: f64,
    pub open_positions: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    Opened(Position),
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedTrade {
    pub trade_id: Uuid,
    pub symbol: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub gross_pnl: f64,
    pub fees: f64,
    pub net_pnl: f64,
    pub pnl_pct: f64,
    pub reason: ExitReason,
    /// `false` when the close sits in the unreconciled queue
    pub persisted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Closed(ClosedTrade),
    Held(ExitReason),
    NoPosition,
}

/// A close the store has not acknowledged yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingClose {
    pub trade_id: Uuid,
    pub symbol: String,
    pub update: TradeUpdate,
    pub attempts: u32,
}

/// `(gross, fees, net)` for a long round trip.
pub fn realized_pnl(entry: f64, exit: f64, quantity: f64, fee_rate: f64) -> (f64, f64, f64) {
    let gross = (exit - entry) * quantity;
    let fees = fee_rate * quantity * (entry + exit);
    (gross, fees, gross - fees)
}

pub struct PositionLedger {
    config: Arc<StrategyConfig>,
    strategy: Box<dyn Strategy>,
    store: Arc<dyn TradeStore>,
    orders: Option<Arc<dyn OrderClient>>,
    balance: f64,
    positions: HashMap<String, Position>,
    /// Time and peak of the last persisted mark per symbol
    last_mark: HashMap<String, (DateTime<Utc>, f64)>,
    unreconciled: Vec<PendingClose>,
}

impl PositionLedger {
    pub fn new(
        config: Arc<StrategyConfig>,
        balance: f64,
        store: Arc<dyn TradeStore>,
        orders: Option<Arc<dyn OrderClient>>,
    ) -> Self {
        let strategy = common::for_kind(&config.strategy_type);
        let ledger = Self {
            config,
            strategy,
            store,
            orders,
            balance,
            positions: HashMap::new(),
            last_mark: HashMap::new(),
            unreconciled: Vec::new(),
        };
        ledger.publish_gauges();
        ledger
    }

    fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn available_balance(&self) -> f64 {
        let committed: f64 = self.positions.values().map(Position::notional).sum();
        (self.balance - committed).max(0.0)
    }

    pub fn portfolio(&self) -> Portfolio {
        Portfolio {
            balance: self.balance,
            available_balance: self.available_balance(),
            open_positions: self.positions.len(),
        }
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn unreconciled(&self) -> &[PendingClose] {
        &self.unreconciled
    }

    /// Units to buy at `price`: the tighter of the account cap and the risk
    /// budget, scaled down when ATR% exceeds `maxVolatility`.
    pub fn position_size(&self, ind: &IndicatorSnapshot, price: f64) -> f64 {
        let cfg = &self.config;
        if !(price > 0.0) || !(cfg.stop_loss_pct > 0.0) {
            return 0.0;
        }
        let by_account = self.balance * cfg.max_position_size / price;
        let by_risk = self.balance * cfg.risk_per_trade / (price * cfg.stop_loss_pct / 100.0);

        let atr_pct = ind.atr_percent(price);
        let vol_adj = if atr_pct > 0.0 {
            (cfg.max_volatility / atr_pct).min(1.0)
        } else {
            1.0
        };
        (by_account.min(by_risk) * vol_adj).min(by_account).max(0.0)
    }

    /// Re-install positions the store still holds open, keeping their
    /// persisted peak. Returns how many were restored.
    pub fn restore(&mut self, rows: Vec<OpenTradeRow>) -> usize {
        let mut restored = 0;
        for row in rows {
            if self.positions.contains_key(&row.symbol) {
                log::error!(
                    "[{}][{}] store holds a second open trade {}, leaving it untouched",
                    self.id(),
                    row.symbol,
                    row.id
                );
                continue;
            }
            let peak = row.peak_price.unwrap_or(row.entry_price).max(row.entry_price);
            log::info!(
                "[{}][{}] restored trade {} ({} @ {}, peak {})",
                self.id(),
                row.symbol,
                row.id,
                row.amount,
                row.entry_price,
                peak
            );
            self.positions.insert(
                row.symbol.clone(),
                Position {
                    trade_id: row.id,
                    symbol: row.symbol,
                    entry_price: row.entry_price,
                    quantity: row.amount,
                    strategy_label: row.strategy_label,
                    entry_time: row.opened_at,
                    peak_price: peak,
                    last_price: row.entry_price,
                },
            );
            restored += 1;
        }
        self.publish_gauges();
        restored
    }

    pub async fn try_open(
        &mut self,
        symbol: &str,
        ind: Option<&IndicatorSnapshot>,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<OpenOutcome, LedgerError> {
        let reject = |reason: String| {
            log::debug!("[{}][{symbol}] no entry: {reason}", self.config.id);
            Ok(OpenOutcome::Rejected(reason))
        };

        if self.positions.contains_key(symbol) {
            return reject("position already open".into());
        }
        if self.positions.len() >= self.config.max_positions {
            return reject(format!("max positions ({}) reached", self.config.max_positions));
        }
        let Some(ind) = ind else {
            return reject("indicators not ready".into());
        };
        if !(price.is_finite() && price > 0.0) {
            return reject(format!("invalid price {price}"));
        }

        let decision = self.strategy.evaluate_entry(ind, &self.config, price);
        if !decision.enter {
            return reject(decision.reason);
        }

        let quantity = self.position_size(ind, price);
        if !(quantity.is_finite() && quantity > 0.0) {
            return reject(format!("position size {quantity} is not tradable"));
        }
        if quantity * price > self.available_balance() {
            return reject("insufficient available balance".into());
        }

        match self.store.query_open_trade_id(symbol, &self.config.id).await {
            Ok(Some((existing, _))) => {
                log::warn!(
                    "[{}][{symbol}] store already holds open trade {existing}, skipping entry",
                    self.id()
                );
                return Ok(OpenOutcome::Rejected("store already holds open trade".into()));
            }
            Ok(None) => {}
            Err(source) => {
                return Err(LedgerError::Lookup {
                    config_id: self.config.id.clone(),
                    symbol: symbol.to_string(),
                    source,
                })
            }
        }

        if let Some(orders) = &self.orders {
            if let Err(source) = orders.submit_market_order(symbol, Side::Buy, quantity).await {
                log::error!("[{}][{symbol}] buy order failed: {source}", self.id());
                return Err(LedgerError::OrderRejected {
                    config_id: self.config.id.clone(),
                    symbol: symbol.to_string(),
                    source,
                });
            }
        }

        let record = OpenTradeRecord {
            id: Uuid::new_v4(),
            config_id: self.config.id.clone(),
            symbol: symbol.to_string(),
            strategy_label: self.strategy.name().to_string(),
            entry_price: price,
            amount: quantity,
            opened_at: now,
            notes: decision.reason.clone(),
        };
        if let Err(source) = self.store.insert_open_trade(&record).await {
            increment_counter!("engine_persist_failures_total", "config" => self.config.id.clone(), "op" => "insert");
            log::error!(
                "[{}][{symbol}] open of trade {} not persisted, discarding ({}{})",
                self.id(),
                record.id,
                source,
                if self.orders.is_some() { "; venue buy already filled, reconcile manually" } else { "" }
            );
            return Err(LedgerError::OpenNotPersisted {
                config_id: self.config.id.clone(),
                symbol: symbol.to_string(),
                source,
            });
        }

        let position = Position {
            trade_id: record.id,
            symbol: symbol.to_string(),
            entry_price: price,
            quantity,
            strategy_label: record.strategy_label,
            entry_time: now,
            peak_price: price,
            last_price: price,
        };
        log::info!(
            "[{}][{symbol}] opened {} @ {price} (trade {}): {}",
            self.id(),
            quantity,
            position.trade_id,
            decision.reason
        );
        self.positions.insert(symbol.to_string(), position.clone());
        self.last_mark.insert(symbol.to_string(), (now, price));
        increment_counter!("engine_positions_opened_total", "config" => self.config.id.clone());
        self.publish_gauges();
        Ok(OpenOutcome::Opened(position))
    }

    /// Observe `price` and close the position if the exit rules say so.
    /// Without indicators the exit rules run on a zeroed snapshot.
    pub async fn try_close(
        &mut self,
        symbol: &str,
        ind: Option<&IndicatorSnapshot>,
        price: f64,
        now: DateTime<Utc>,
    ) -> CloseOutcome {
        let zeroed = IndicatorSnapshot::default();
        let ind = ind.unwrap_or(&zeroed);
        let Some(pos) = self.positions.get_mut(symbol) else {
            return CloseOutcome::NoPosition;
        };
        pos.observe(price);
        let decision = self
            .strategy
            .evaluate_exit(pos, ind, &self.config, price, pos.peak_price, now);
        if !decision.exit {
            return CloseOutcome::Held(decision.reason);
        }
        self.close_position(symbol, price, decision.reason, now).await
    }

    /// Peak tracking plus a best-effort unrealized-PnL row refresh.
    pub async fn mark_price(&mut self, symbol: &str, price: f64, now: DateTime<Utc>) {
        let Some(pos) = self.positions.get_mut(symbol) else {
            return;
        };
        pos.observe(price);
        let (peak_rose, due) = match self.last_mark.get(symbol) {
            Some((at, peak)) => (
                pos.peak_price > *peak,
                now - *at >= Duration::seconds(MARK_PERSIST_INTERVAL_SECS),
            ),
            None => (true, true),
        };
        if !(peak_rose || due) {
            return;
        }
        let update = TradeUpdate::Mark {
            pnl: pos.unrealized_pnl(price),
            pnl_pct: pos.pnl_pct(price),
            peak_price: pos.peak_price,
        };
        let (trade_id, peak) = (pos.trade_id, pos.peak_price);
        match self.store.update_trade(trade_id, &update).await {
            Ok(()) => {
                self.last_mark.insert(symbol.to_string(), (now, peak));
            }
            Err(e) => {
                increment_counter!("engine_persist_failures_total", "config" => self.config.id.clone(), "op" => "mark");
                log::warn!("[{}][{symbol}] mark of trade {trade_id} not persisted: {e}", self.id());
            }
        }
    }

    /// Liquidate every position at its last observed price.
    pub async fn close_all(&mut self, now: DateTime<Utc>) -> Vec<ClosedTrade> {
        let mut symbols: Vec<(String, f64)> = self
            .positions
            .values()
            .map(|p| (p.symbol.clone(), p.last_price))
            .collect();
        symbols.sort_by(|a, b| a.0.cmp(&b.0));

        let mut closed = Vec::with_capacity(symbols.len());
        for (symbol, price) in symbols {
            if let CloseOutcome::Closed(t) = self.close_position(&symbol, price, ExitReason::Shutdown, now).await {
                closed.push(t);
            }
        }
        closed
    }

    /// Retry queued closes; returns how many are still outstanding.
    pub async fn flush_unreconciled(&mut self) -> usize {
        if self.unreconciled.is_empty() {
            return 0;
        }
        let pending = std::mem::take(&mut self.unreconciled);
        for mut p in pending {
            match self.store.update_trade(p.trade_id, &p.update).await {
                Ok(()) => log::info!(
                    "[{}][{}] close of trade {} reconciled after {} attempts",
                    self.id(),
                    p.symbol,
                    p.trade_id,
                    p.attempts + 1
                ),
                Err(e) => {
                    p.attempts += 1;
                    log::error!(
                        "[{}][{}] close of trade {} still not persisted (attempt {}): {e}; update={:?}",
                        self.id(),
                        p.symbol,
                        p.trade_id,
                        p.attempts,
                        p.update
                    );
                    self.unreconciled.push(p);
                }
            }
        }
        self.unreconciled.len()
    }

    async fn close_position(
        &mut self,
        symbol: &str,
        price: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> CloseOutcome {
        let Some(pos) = self.positions.remove(symbol) else {
            return CloseOutcome::NoPosition;
        };
        self.last_mark.remove(symbol);

        if let Some(orders) = &self.orders {
            if let Err(e) = orders.submit_market_order(symbol, Side::Sell, pos.quantity).await {
                log::error!(
                    "[{}][{symbol}] sell order for trade {} failed, closing locally anyway: {e}",
                    self.config.id,
                    pos.trade_id
                );
            }
        }

        let (gross, fees, net) = realized_pnl(pos.entry_price, price, pos.quantity, self.config.fee_rate);
        let pnl_pct = if pos.notional() > 0.0 { net / pos.notional() * 100.0 } else { 0.0 };
        self.balance += net;

        let update = TradeUpdate::Close {
            exit_price: price,
            closed_at: now,
            pnl: net,
            pnl_pct,
            fees,
            peak_price: pos.peak_price,
            reason: reason.as_str().to_string(),
        };
        let persisted = match self.store.update_trade(pos.trade_id, &update).await {
            Ok(()) => true,
            Err(e) => {
                increment_counter!("engine_persist_failures_total", "config" => self.config.id.clone(), "op" => "close");
                log::error!(
                    "[{}][{symbol}] close of trade {} not persisted, queued for reconciliation: {e}; update={:?}",
                    self.config.id,
                    pos.trade_id,
                    update
                );
                self.unreconciled.push(PendingClose {
                    trade_id: pos.trade_id,
                    symbol: symbol.to_string(),
                    update,
                    attempts: 1,
                });
                false
            }
        };

        log::info!(
            "[{}][{symbol}] closed {} @ {price} ({reason}): net {net:.4} after {fees:.4} fees, balance {:.2}",
            self.config.id,
            pos.quantity,
            self.balance
        );
        increment_counter!(
            "engine_positions_closed_total",
            "config" => self.config.id.clone(),
            "reason" => reason.as_str()
        );
        self.publish_gauges();

        CloseOutcome::Closed(ClosedTrade {
            trade_id: pos.trade_id,
            symbol: pos.symbol,
            entry_price: pos.entry_price,
            exit_price: price,
            quantity: pos.quantity,
            gross_pnl: gross,
            fees,
            net_pnl: net,
            pnl_pct,
            reason,
            persisted,
        })
    }

    fn publish_gauges(&self) {
        gauge!("engine_open_positions", self.positions.len() as f64, "config" => self.config.id.clone());
        gauge!("engine_balance", self.balance, "config" => self.config.id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::strategies;
    use crate::db::store::MemoryTradeStore;
    use crate::services::trading_engine::RecordingOrderClient;
    use chrono::TimeZone;

    fn t(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn cfg() -> StrategyConfig {
        StrategyConfig {
            macd_cross_needed: false,
            require_volume_spike: false,
            max_positions: 2,
            ..strategies::mean_reversion()
        }
    }

    fn oversold() -> IndicatorSnapshot {
        let mut ind = IndicatorSnapshot::default();
        ind.rsi.current = 10.0;
        ind.atr = 1.0;
        ind
    }

    fn ledger(store: Arc<MemoryTradeStore>) -> PositionLedger {
        PositionLedger::new(Arc::new(cfg()), 10_000.0, store, None)
    }

    #[test]
    fn fees_reduce_net_pnl() {
        let (gross, fees, net) = realized_pnl(100.0, 110.0, 1.0, 0.004);
        assert!((gross - 10.0).abs() < 1e-12);
        assert!((fees - 0.84).abs() < 1e-12);
        assert!((net - 9.16).abs() < 1e-12);
    }

    #[test]
    fn sizing_takes_tighter_bound_and_volatility_cut() {
        let store = Arc::new(MemoryTradeStore::new());
        let l = ledger(store);
        let mut ind = IndicatorSnapshot::default();
        ind.atr = 1.0; // 1% ATR, below the 3% ceiling
        // account cap 10_000 × 0.05 / 100 = 5, risk 400 / 3 = 133.3
        assert!((l.position_size(&ind, 100.0) - 5.0).abs() < 1e-9);
        ind.atr = 6.0; // 6% ATR halves it
        assert!((l.position_size(&ind, 100.0) - 2.5).abs() < 1e-9);
        assert_eq!(l.position_size(&ind, 0.0), 0.0);
    }

    #[tokio::test]
    async fn open_then_close_updates_balance_and_store() {
        let store = Arc::new(MemoryTradeStore::new());
        let mut l = ledger(store.clone());

        let opened = l.try_open("BTC/USD", Some(&oversold()), 100.0, t(0)).await.unwrap();
        let OpenOutcome::Opened(pos) = opened else { panic!("expected open, got {opened:?}") };
        assert_eq!(store.open_count(), 1);
        assert!((l.available_balance() - (10_000.0 - pos.notional())).abs() < 1e-9);

        // take profit at +7% once the minimum hold has passed
        let out = l.try_close("BTC/USD", Some(&oversold()), 107.0, t(10)).await;
        let CloseOutcome::Closed(closed) = out else { panic!("expected close, got {out:?}") };
        assert_eq!(closed.reason, ExitReason::TakeProfit);
        assert!(closed.persisted);
        assert!((l.balance() - (10_000.0 + closed.net_pnl)).abs() < 1e-9);
        assert_eq!(store.open_count(), 0);
        assert_eq!(l.portfolio().open_positions, 0);
    }

    #[tokio::test]
    async fn duplicate_symbol_and_capacity_are_rejected() {
        let store = Arc::new(MemoryTradeStore::new());
        let mut l = ledger(store.clone());
        let ind = oversold();

        assert!(matches!(l.try_open("A/USD", Some(&ind), 10.0, t(0)).await, Ok(OpenOutcome::Opened(_))));
        assert_eq!(
            l.try_open("A/USD", Some(&ind), 10.0, t(1)).await.unwrap(),
            OpenOutcome::Rejected("position already open".into())
        );
        assert!(matches!(l.try_open("B/USD", Some(&ind), 10.0, t(1)).await, Ok(OpenOutcome::Opened(_))));
        assert!(matches!(
            l.try_open("C/USD", Some(&ind), 10.0, t(2)).await,
            Ok(OpenOutcome::Rejected(r)) if r.starts_with("max positions")
        ));
        assert_eq!(store.open_count(), 2);
    }

    #[tokio::test]
    async fn not_ready_indicators_skip_entry() {
        let store = Arc::new(MemoryTradeStore::new());
        let mut l = ledger(store);
        assert_eq!(
            l.try_open("BTC/USD", None, 100.0, t(0)).await.unwrap(),
            OpenOutcome::Rejected("indicators not ready".into())
        );
    }

    #[tokio::test]
    async fn failed_insert_leaves_ledger_untouched() {
        let store = Arc::new(MemoryTradeStore::new());
        let mut l = ledger(store.clone());
        store.set_fail_inserts(true);

        let before = l.portfolio();
        let err = l.try_open("BTC/USD", Some(&oversold()), 100.0, t(0)).await.unwrap_err();
        assert!(matches!(err, LedgerError::OpenNotPersisted { .. }));
        assert_eq!(l.portfolio(), before);
        assert!(l.position("BTC/USD").is_none());
        assert!(store.all().is_empty());
    }

    #[tokio::test]
    async fn store_guard_blocks_duplicate_open() {
        let store = Arc::new(MemoryTradeStore::new());
        let mut other = ledger(store.clone());
        other.try_open("BTC/USD", Some(&oversold()), 100.0, t(0)).await.unwrap();

        // a second ledger for the same config id, e.g. after a crash without restore
        let mut l = ledger(store.clone());
        assert_eq!(
            l.try_open("BTC/USD", Some(&oversold()), 100.0, t(1)).await.unwrap(),
            OpenOutcome::Rejected("store already holds open trade".into())
        );
        assert_eq!(store.open_count(), 1);
    }

    #[tokio::test]
    async fn failed_close_is_queued_and_reconciled() {
        let store = Arc::new(MemoryTradeStore::new());
        let mut l = ledger(store.clone());
        let OpenOutcome::Opened(pos) = l.try_open("BTC/USD", Some(&oversold()), 100.0, t(0)).await.unwrap() else {
            panic!("expected open");
        };

        store.set_fail_updates(true);
        let out = l.try_close("BTC/USD", None, 90.0, t(10)).await;
        assert!(matches!(out, CloseOutcome::Closed(ClosedTrade { persisted: false, reason: ExitReason::StopLoss, .. })));
        assert!(l.position("BTC/USD").is_none());
        assert_eq!(l.unreconciled().len(), 1);
        assert_eq!(l.flush_unreconciled().await, 1);
        assert_eq!(l.unreconciled()[0].attempts, 2);

        store.set_fail_updates(false);
        assert_eq!(l.flush_unreconciled().await, 0);
        assert!(store.get(pos.trade_id).unwrap().closed);
    }

    #[tokio::test]
    async fn peak_is_monotonic_and_persisted_on_rise() {
        let store = Arc::new(MemoryTradeStore::new());
        let mut l = ledger(store.clone());
        let OpenOutcome::Opened(pos) = l.try_open("BTC/USD", Some(&oversold()), 100.0, t(0)).await.unwrap() else {
            panic!("expected open");
        };
        l.mark_price("BTC/USD", 104.0, t(1)).await;
        l.mark_price("BTC/USD", 102.0, t(1)).await;
        assert_eq!(l.position("BTC/USD").unwrap().peak_price, 104.0);
        assert_eq!(l.position("BTC/USD").unwrap().last_price, 102.0);
        assert_eq!(store.get(pos.trade_id).unwrap().peak_price, 104.0);
    }

    #[tokio::test]
    async fn peak_seen_by_exit_check_is_still_persisted() {
        let store = Arc::new(MemoryTradeStore::new());
        let mut l = ledger(store.clone());
        let OpenOutcome::Opened(pos) = l.try_open("BTC/USD", Some(&oversold()), 100.0, t(0)).await.unwrap() else {
            panic!("expected open");
        };
        let now = t(0) + Duration::seconds(10);
        assert!(matches!(
            l.try_close("BTC/USD", None, 103.0, now).await,
            CloseOutcome::Held(ExitReason::MinHoldTime)
        ));
        l.mark_price("BTC/USD", 103.0, now).await;
        assert_eq!(store.get(pos.trade_id).unwrap().peak_price, 103.0);

        // no new peak, inside the throttle window
        let calls = store.update_calls.load(std::sync::atomic::Ordering::SeqCst);
        l.mark_price("BTC/USD", 101.0, now + Duration::seconds(5)).await;
        assert_eq!(store.update_calls.load(std::sync::atomic::Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn restore_uses_persisted_peak() {
        let store = Arc::new(MemoryTradeStore::new());
        let mut first = ledger(store.clone());
        first.try_open("BTC/USD", Some(&oversold()), 100.0, t(0)).await.unwrap();
        first.mark_price("BTC/USD", 112.0, t(2)).await;

        let mut l = ledger(store.clone());
        let rows = store.open_trades("mean-reversion").await.unwrap();
        assert_eq!(l.restore(rows), 1);
        let p = l.position("BTC/USD").unwrap();
        assert_eq!(p.peak_price, 112.0);
        assert_eq!(p.entry_time, t(0));
    }

    #[tokio::test]
    async fn close_all_liquidates_at_last_price() {
        let store = Arc::new(MemoryTradeStore::new());
        let mut l = ledger(store.clone());
        let ind = oversold();
        l.try_open("A/USD", Some(&ind), 10.0, t(0)).await.unwrap();
        l.try_open("B/USD", Some(&ind), 20.0, t(0)).await.unwrap();
        l.mark_price("A/USD", 11.0, t(1)).await;

        let closed = l.close_all(t(2)).await;
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|c| c.reason == ExitReason::Shutdown));
        assert_eq!(closed[0].symbol, "A/USD");
        assert_eq!(closed[0].exit_price, 11.0);
        assert_eq!(store.open_count(), 0);
    }

    fn live_ledger(store: Arc<MemoryTradeStore>, orders: Arc<RecordingOrderClient>) -> PositionLedger {
        PositionLedger::new(Arc::new(cfg()), 10_000.0, store, Some(orders))
    }

    #[tokio::test]
    async fn rejected_buy_aborts_open_without_trace() {
        let store = Arc::new(MemoryTradeStore::new());
        let orders = Arc::new(RecordingOrderClient::new());
        orders.set_fail_buys(true);
        let mut l = live_ledger(store.clone(), orders.clone());

        let before = l.portfolio();
        let res = l.try_open("BTC/USD", Some(&oversold()), 100.0, t(0)).await;
        assert!(matches!(res, Err(LedgerError::OrderRejected { .. })));
        assert!(l.position("BTC/USD").is_none());
        assert_eq!(l.portfolio(), before);
        assert!(store.all().is_empty());
        assert!(orders.orders().is_empty());
    }

    #[tokio::test]
    async fn live_open_and_close_send_orders() {
        let store = Arc::new(MemoryTradeStore::new());
        let orders = Arc::new(RecordingOrderClient::new());
        let mut l = live_ledger(store.clone(), orders.clone());

        let OpenOutcome::Opened(pos) = l.try_open("BTC/USD", Some(&oversold()), 100.0, t(0)).await.unwrap() else {
            panic!("expected open");
        };
        assert!(matches!(l.try_close("BTC/USD", None, 110.0, t(10)).await, CloseOutcome::Closed(_)));
        let sent = orders.orders();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], ("BTC/USD".to_string(), Side::Buy, pos.quantity));
        assert_eq!(sent[1], ("BTC/USD".to_string(), Side::Sell, pos.quantity));
    }

    #[tokio::test]
    async fn rejected_sell_still_closes_and_persists() {
        let store = Arc::new(MemoryTradeStore::new());
        let orders = Arc::new(RecordingOrderClient::new());
        let mut l = live_ledger(store.clone(), orders.clone());
        let OpenOutcome::Opened(pos) = l.try_open("BTC/USD", Some(&oversold()), 100.0, t(0)).await.unwrap() else {
            panic!("expected open");
        };

        orders.set_fail_sells(true);
        let out = l.try_close("BTC/USD", None, 90.0, t(10)).await;
        assert!(matches!(
            out,
            CloseOutcome::Closed(ClosedTrade { persisted: true, reason: ExitReason::StopLoss, .. })
        ));
        assert!(l.position("BTC/USD").is_none());
        assert!(l.balance() < 10_000.0);
        let stored = store.get(pos.trade_id).unwrap();
        assert!(stored.closed);
        assert_eq!(orders.orders().len(), 1);
    }

    #[tokio::test]
    async fn failed_duplicate_lookup_leaves_no_position() {
        let store = Arc::new(MemoryTradeStore::new());
        let mut l = ledger(store.clone());
        store.set_fail_queries(true);

        let before = l.portfolio();
        let res = l.try_open("BTC/USD", Some(&oversold()), 100.0, t(0)).await;
        assert!(matches!(res, Err(LedgerError::Lookup { ref symbol, .. }) if symbol == "BTC/USD"));
        assert!(l.position("BTC/USD").is_none());
        assert_eq!(l.portfolio(), before);
        assert!(store.all().is_empty());

        store.set_fail_queries(false);
        assert!(matches!(
            l.try_open("BTC/USD", Some(&oversold()), 100.0, t(1)).await,
            Ok(OpenOutcome::Opened(_))
        ));
    }
}
