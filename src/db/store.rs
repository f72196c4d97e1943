//! Persistence seam used by the position ledger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::db::models::{OpenTradeRecord, OpenTradeRow, TradeUpdate};
use crate::utils::errors::StoreError;

#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn insert_open_trade(&self, rec: &OpenTradeRecord) -> Result<(), StoreError>;

    async fn update_trade(&self, id: Uuid, update: &TradeUpdate) -> Result<(), StoreError>;

    /// Open trade for `(symbol, config_id)`, with its persisted peak price.
    async fn query_open_trade_id(
        &self,
        symbol: &str,
        config_id: &str,
    ) -> Result<Option<(Uuid, f64)>, StoreError>;

    async fn open_trades(&self, config_id: &str) -> Result<Vec<OpenTradeRow>, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredTrade {
    pub record: OpenTradeRecord,
    pub peak_price: f64,
    pub last_update: Option<TradeUpdate>,
    pub closed: bool,
}

/// In-process store for tests and dry runs. Failures can be switched on per
/// operation.
#[derive(Default)]
pub struct MemoryTradeStore {
    trades: Mutex<HashMap<Uuid, StoredTrade>>,
    pub fail_inserts: AtomicBool,
    pub fail_updates: AtomicBool,
    pub fail_queries: AtomicBool,
    pub update_calls: AtomicUsize,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_inserts(&self, on: bool) {
        self.fail_inserts.store(on, Ordering::SeqCst);
    }
    pub fn set_fail_updates(&self, on: bool) {
        self.fail_updates.store(on, Ordering::SeqCst);
    }
    pub fn set_fail_queries(&self, on: bool) {
        self.fail_queries.store(on, Ordering::SeqCst);
    }

    pub fn get(&self, id: Uuid) -> Option<StoredTrade> {
        self.lock().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<StoredTrade> {
        self.lock().values().cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.lock().values().filter(|t| !t.closed).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, StoredTrade>> {
        // a poisoned map is still usable for test bookkeeping
        self.trades.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn insert_open_trade(&self, rec: &OpenTradeRecord) -> Result<(), StoreError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("insert disabled".into()));
        }
        self.lock().entry(rec.id).or_insert_with(|| StoredTrade {
            record: rec.clone(),
            peak_price: rec.entry_price,
            last_update: None,
            closed: false,
        });
        Ok(())
    }

    async fn update_trade(&self, id: Uuid, update: &TradeUpdate) -> Result<(), StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("update disabled".into()));
        }
        let mut trades = self.lock();
        let t = trades.get_mut(&id).ok_or(StoreError::MissingTrade(id))?;
        match update {
            TradeUpdate::Mark { peak_price, .. } => t.peak_price = *peak_price,
            TradeUpdate::Close { peak_price, .. } => {
                t.peak_price = *peak_price;
                t.closed = true;
            }
        }
        t.last_update = Some(update.clone());
        Ok(())
    }

    async fn query_open_trade_id(
        &self,
        symbol: &str,
        config_id: &str,
    ) -> Result<Option<(Uuid, f64)>, StoreError> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("query disabled".into()));
        }
        Ok(self
            .lock()
            .values()
            .find(|t| !t.closed && t.record.symbol == symbol && t.record.config_id == config_id)
            .map(|t| (t.record.id, t.peak_price)))
    }

    async fn open_trades(&self, config_id: &str) -> Result<Vec<OpenTradeRow>, StoreError> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("query disabled".into()));
        }
        let mut rows: Vec<OpenTradeRow> = self
            .lock()
            .values()
            .filter(|t| !t.closed && t.record.config_id == config_id)
            .map(|t| OpenTradeRow {
                id: t.record.id,
                symbol: t.record.symbol.clone(),
                strategy_label: t.record.strategy_label.clone(),
                entry_price: t.record.entry_price,
                amount: t.record.amount,
                peak_price: Some(t.peak_price),
                opened_at: t.record.opened_at,
            })
            .collect();
        rows.sort_by_key(|r| r.opened_at);
        Ok(rows)
    }
}
