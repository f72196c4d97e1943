//! Bounded retry with exponential backoff + jitter.
//!
//! One policy type serves both the persistence layer (short, tight retries on
//! deadlocks / pool timeouts) and the market-data transport (slow reconnects).

use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the uniform random delay added to every wait
    pub max_jitter: Duration,
}

impl RetryPolicy {
    /// Store calls: 3 attempts, 200 ms → 2 s, ≤ 100 ms jitter.
    pub const fn persistence() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            max_jitter: Duration::from_millis(100),
        }
    }

    /// WebSocket reconnects: 5 attempts, 5 s doubling, ≤ 1 s jitter.
    pub const fn reconnect() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(80),
            max_jitter: Duration::from_secs(1),
        }
    }

    /// No waiting at all (tests, and callers that only want the attempt bound).
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// Deterministic part of the wait after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// `backoff(attempt)` plus uniform jitter in `[0, max_jitter]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.backoff(attempt) + jitter
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned on exhaustion.
    pub async fn retry<T, E, F, Fut>(
        &self,
        label: &str,
        is_transient: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.max_attempts && is_transient(&e) => {
                    let wait = self.delay(attempt);
                    log::warn!(
                        "{label}: attempt {attempt}/{} failed ({e}), retrying in {wait:?}",
                        self.max_attempts
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    if attempt >= self.max_attempts {
                        log::error!("{label}: giving up after {attempt} attempts: {e}");
                    }
                    return Err(e);
                }
            }
        }
    }
}
