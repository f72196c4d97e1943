//  src/db/redis.rs

use std::time::Instant;

use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError, ToRedisArgs};
use serde::{de::DeserializeOwned, Serialize};

/// Thin, cheap-to-clone handle. `ConnectionManager` reconnects on its own.
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
}

impl RedisPool {
    pub async fn new(url: &str) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }

    /// Store `value` as JSON; `ttl_secs == 0` means no expiry.
    pub async fn set_json<K, T>(&self, key: K, value: &T, ttl_secs: u64) -> Result<(), RedisError>
    where
        K: ToRedisArgs + Send + Sync,
        T: Serialize,
    {
        let mut con = self.manager.clone();
        let payload = serde_json::to_string(value).map_err(serde_err)?;

        let started = Instant::now();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(payload);
        if ttl_secs > 0 {
            cmd.arg("EX").arg(ttl_secs);
        }
        cmd.query_async::<_, ()>(&mut con).await?;
        log::debug!("redis SET took {:?}", started.elapsed());
        Ok(())
    }

    pub async fn get_json<K, T>(&self, key: K) -> Result<Option<T>, RedisError>
    where
        K: ToRedisArgs + Send + Sync,
        T: DeserializeOwned,
    {
        let mut con = self.manager.clone();
        let started = Instant::now();
        let raw: Option<String> = con.get(key).await?;
        log::debug!("redis GET took {:?}", started.elapsed());

        raw.map(|s| serde_json::from_str(&s).map_err(serde_err))
            .transpose()
    }
}

fn serde_err(e: serde_json::Error) -> RedisError {
    RedisError::from((redis::ErrorKind::TypeError, "serde", e.to_string()))
}

/// Cache key for a symbol's bootstrap history: `"candles:BTC/USD:5m"`.
pub fn candles_key(symbol: &str, interval_minutes: u32) -> String {
    format!("candles:{symbol}:{interval_minutes}m")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_keys_are_namespaced_by_interval() {
        assert_eq!(candles_key("BTC/USD", 5), "candles:BTC/USD:5m");
        assert_ne!(candles_key("BTC/USD", 5), candles_key("BTC/USD", 15));
    }
}
