use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Row written when a position opens. `id` is generated client-side so a
/// retried insert is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenTradeRecord {
    pub id: Uuid,
    pub config_id: String,
    pub symbol: String,
    pub strategy_label: String,
    pub entry_price: f64,
    pub amount: f64,
    pub opened_at: DateTime<Utc>,
    /// Entry reason
    pub notes: String,
}

/// Fields changed on an existing trade row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TradeUpdate {
    /// Mark-to-market of a still-open position
    Mark {
        pnl: f64,
        pnl_pct: f64,
        peak_price: f64,
    },
    Close {
        exit_price: f64,
        closed_at: DateTime<Utc>,
        pnl: f64,
        pnl_pct: f64,
        fees: f64,
        peak_price: f64,
        reason: String,
    },
}

/// Open trade as read back on restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct OpenTradeRow {
    pub id: Uuid,
    pub symbol: String,
    pub strategy_label: String,
    pub entry_price: f64,
    pub amount: f64,
    pub peak_price: Option<f64>,
    pub opened_at: DateTime<Utc>,
}
