// src/services/trading_engine.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::utils::errors::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderAck {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    /// Raw venue answer (txids, description)
    pub data: Value,
}

/// Venue order submission, used only by live configurations.
#[async_trait]
pub trait OrderClient: Send + Sync {
    async fn submit_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderAck, ApiError>;
}

/// In-process venue for tests and paper runs: fills every order unless the
/// matching failure switch is on, and records what it was asked to do.
#[derive(Default)]
pub struct RecordingOrderClient {
    pub fail_buys: AtomicBool,
    pub fail_sells: AtomicBool,
    orders: Mutex<Vec<(String, Side, f64)>>,
}

impl RecordingOrderClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_buys(&self, on: bool) {
        self.fail_buys.store(on, Ordering::SeqCst);
    }
    pub fn set_fail_sells(&self, on: bool) {
        self.fail_sells.store(on, Ordering::SeqCst);
    }

    /// Accepted orders, oldest first.
    pub fn orders(&self) -> Vec<(String, Side, f64)> {
        self.orders.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl OrderClient for RecordingOrderClient {
    async fn submit_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderAck, ApiError> {
        let failing = match side {
            Side::Buy => &self.fail_buys,
            Side::Sell => &self.fail_sells,
        };
        if failing.load(Ordering::SeqCst) {
            return Err(ApiError::Exchange(vec!["EOrder:Insufficient funds".into()]));
        }
        self.orders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((symbol.to_string(), side, quantity));
        Ok(OrderAck {
            symbol: symbol.to_string(),
            side,
            quantity,
            data: Value::Null,
        })
    }
}
