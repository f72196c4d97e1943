//! Production adapter that talks to Kraken's REST API.
//! Implements the `OrderClient` trait expected by the position ledger.

use async_trait::async_trait;
use reqwest::Client;

use crate::services::kraken::api;
use crate::services::trading_engine::{OrderAck, OrderClient, Side};
use crate::utils::errors::ApiError;

pub struct KrakenClient {
    http: Client,
    base: String,
    api_key: String,
    api_secret: String,
}

impl KrakenClient {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base: api::BASE_URL.to_string(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }
}

#[async_trait]
impl OrderClient for KrakenClient {
    async fn submit_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<OrderAck, ApiError> {
        if !(quantity.is_finite() && quantity > 0.0) {
            return Err(ApiError::Other(format!("refusing order with volume {quantity}")));
        }
        let data = api::add_order(
            &self.http,
            &self.base,
            &self.api_key,
            &self.api_secret,
            symbol,
            side.as_str(),
            quantity,
        )
        .await?;
        log::info!("[{symbol}] kraken {} {quantity} posted: {data}", side.as_str());
        Ok(OrderAck {
            symbol: symbol.to_string(),
            side,
            quantity,
            data,
        })
    }
}
