//! Historical candles and starting balance for a pipeline instance.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;

use crate::config::strategies::StrategyConfig;
use crate::db::redis::{candles_key, RedisPool};
use crate::services::candles::Candle;
use crate::services::kraken::api;
use crate::utils::errors::{ApiError, EngineError};

#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Candles oldest first; the newest one may still be forming.
    async fn candles(&self, symbol: &str, interval_minutes: u32) -> Result<Vec<Candle>, ApiError>;
}

/// Kraken public OHLC endpoint.
pub struct KrakenHistory {
    http: Client,
    base: String,
}

impl KrakenHistory {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
            base: api::BASE_URL.to_string(),
        }
    }
}

impl Default for KrakenHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistorySource for KrakenHistory {
    async fn candles(&self, symbol: &str, interval_minutes: u32) -> Result<Vec<Candle>, ApiError> {
        api::fetch_ohlc(&self.http, &self.base, symbol, interval_minutes).await
    }
}

/// Redis read-through cache in front of another source. Entries live for
/// one interval; cache errors fall through to the inner source.
pub struct CachedHistory<S> {
    inner: S,
    redis: RedisPool,
}

impl<S: HistorySource> CachedHistory<S> {
    pub fn new(inner: S, redis: RedisPool) -> Self {
        Self { inner, redis }
    }
}

#[async_trait]
impl<S: HistorySource> HistorySource for CachedHistory<S> {
    async fn candles(&self, symbol: &str, interval_minutes: u32) -> Result<Vec<Candle>, ApiError> {
        let key = candles_key(symbol, interval_minutes);
        match self.redis.get_json::<_, Vec<Candle>>(&key).await {
            Ok(Some(hit)) if !hit.is_empty() => {
                log::debug!("[{symbol}] history cache hit ({} candles)", hit.len());
                return Ok(hit);
            }
            Ok(_) => {}
            Err(e) => log::warn!("[{symbol}] history cache read failed: {e}"),
        }

        let fresh = self.inner.candles(symbol, interval_minutes).await?;
        let ttl = u64::from(interval_minutes) * 60;
        if let Err(e) = self.redis.set_json(&key, &fresh, ttl).await {
            log::warn!("[{symbol}] history cache write failed: {e}");
        }
        Ok(fresh)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Bootstrap {
    /// Per symbol, oldest first, newest row still forming
    pub history: HashMap<String, Vec<Candle>>,
    pub balance: f64,
}

/// Fetch every symbol's window. A symbol that fails starts empty and warms
/// up from the stream; all symbols failing is fatal for the configuration.
pub async fn bootstrap(
    source: &dyn HistorySource,
    cfg: &StrategyConfig,
    symbols: &[String],
) -> Result<Bootstrap, EngineError> {
    let balance = cfg.trade_balance;
    if !(balance.is_finite() && balance > 0.0) {
        return Err(EngineError::Bootstrap {
            config_id: cfg.id.clone(),
            reason: format!("starting balance {balance} is not positive"),
        });
    }

    let keep = cfg.buffer_capacity() + 1;
    let mut history = HashMap::with_capacity(symbols.len());
    let mut failures = Vec::new();
    for symbol in symbols {
        match source.candles(symbol, cfg.interval_minutes).await {
            Ok(mut candles) => {
                if candles.len() > keep {
                    candles.drain(..candles.len() - keep);
                }
                log::info!("[{}][{symbol}] bootstrapped {} candles", cfg.id, candles.len());
                history.insert(symbol.clone(), candles);
            }
            Err(e) => {
                log::error!("[{}][{symbol}] history fetch failed, warming up from stream: {e}", cfg.id);
                failures.push(format!("{symbol}: {e}"));
            }
        }
    }

    if history.is_empty() && !symbols.is_empty() {
        return Err(EngineError::Bootstrap {
            config_id: cfg.id.clone(),
            reason: format!("no symbol could be bootstrapped ({})", failures.join("; ")),
        });
    }
    Ok(Bootstrap { history, balance })
}
