// src/utils/errors.rs

use std::{error::Error, fmt};
use reqwest;
use serde_json;
use tungstenite::Error as WsError;

/// Errors coming from external API calls (HTTP, JSON, WS, etc).
#[derive(Debug)]
pub enum ApiError {
    Http(reqwest::Error),
    Json(serde_json::Error),
    WebSocket(WsError),
    /// Kraken answered 200 but with a non-empty `error` array
    Exchange(Vec<String>),
    Other(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Http(e)      => write!(f, "HTTP error: {}", e),
            ApiError::Json(e)      => write!(f, "JSON error: {}", e),
            ApiError::WebSocket(e) => write!(f, "WebSocket error: {}", e),
            ApiError::Exchange(v)  => write!(f, "Exchange error: {}", v.join(", ")),
            ApiError::Other(msg)   => write!(f, "{}", msg),
        }
    }
}

impl Error for ApiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ApiError::Http(e)      => Some(e),
            ApiError::Json(e)      => Some(e),
            ApiError::WebSocket(e) => Some(e),
            ApiError::Exchange(_)  => None,
            ApiError::Other(_)     => None,
        }
    }
}

// Conversions from underlying errors into ApiError
impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self { ApiError::Http(err) }
}
impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self { ApiError::Json(err) }
}
impl From<WsError> for ApiError {
    fn from(err: WsError) -> Self { ApiError::WebSocket(err) }
}

/// Persistence collaborator failures.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("db: {0}")]
    Db(#[from] sqlx::Error),
    #[error("no trade row with id {0}")]
    MissingTrade(uuid::Uuid),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// SQLSTATEs worth another attempt: deadlock, serialization failure, lock not available.
const TRANSIENT_SQLSTATES: &[&str] = &["40P01", "40001", "55P03"];

impl StoreError {
    /// Whether retrying the same call can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Db(sqlx::Error::Io(_))
            | StoreError::Db(sqlx::Error::PoolTimedOut)
            | StoreError::Db(sqlx::Error::WorkerCrashed) => true,
            StoreError::Db(sqlx::Error::Database(db)) => db
                .code()
                .map(|c| TRANSIENT_SQLSTATES.iter().any(|s| c == *s))
                .unwrap_or(false),
            StoreError::Unavailable(_) => true,
            _ => false,
        }
    }
}

/// Failures of a position state transition.
#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    /// Open path: nothing was installed locally.
    #[error("[{config_id}][{symbol}] open not persisted, position discarded: {source}")]
    OpenNotPersisted {
        config_id: String,
        symbol: String,
        #[source]
        source: StoreError,
    },
    /// Open path (live): the venue rejected the order, nothing was installed locally.
    #[error("[{config_id}][{symbol}] buy order failed, open aborted: {source}")]
    OrderRejected {
        config_id: String,
        symbol: String,
        #[source]
        source: ApiError,
    },
    /// Duplicate-position guard could not reach the store.
    #[error("[{config_id}][{symbol}] open-trade lookup failed: {source}")]
    Lookup {
        config_id: String,
        symbol: String,
        #[source]
        source: StoreError,
    },
}

/// Fatal errors for a single pipeline instance. Siblings keep running.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("bootstrap failed for {config_id}: {reason}")]
    Bootstrap { config_id: String, reason: String },
    #[error("position recovery failed for {config_id}: {source}")]
    Recovery {
        config_id: String,
        #[source]
        source: StoreError,
    },
    #[error("configuration {0} is already running")]
    DuplicateConfig(String),
    #[error(transparent)]
    Config(#[from] crate::config::strategies::ConfigError),
}
