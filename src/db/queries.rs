use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::*;
use crate::db::store::TradeStore;
use crate::utils::errors::StoreError;
use crate::utils::retry::RetryPolicy;

/// `trades` table accessor. Every call retries transient failures.
#[derive(Clone)]
pub struct PgTradeStore {
    pool: PgPool,
    policy: RetryPolicy,
}

impl PgTradeStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            policy: RetryPolicy::persistence(),
        }
    }
}

// TRADES
#[async_trait]
impl TradeStore for PgTradeStore {
    async fn insert_open_trade(&self, rec: &OpenTradeRecord) -> Result<(), StoreError> {
        self.policy
            .retry("insert_open_trade", StoreError::is_transient, move || async move {
                sqlx::query(
                    "INSERT INTO trades
                        (id, config_id, symbol, strategy_label, side, status,
                         entry_price, amount, peak_price, opened_at, notes)
                     VALUES ($1, $2, $3, $4, 'buy', 'open', $5, $6, $5, $7, $8)
                     ON CONFLICT (id) DO NOTHING",
                )
                .bind(rec.id)
                .bind(&rec.config_id)
                .bind(&rec.symbol)
                .bind(&rec.strategy_label)
                .bind(rec.entry_price)
                .bind(rec.amount)
                .bind(rec.opened_at)
                .bind(&rec.notes)
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(StoreError::from)
            })
            .await
    }

    async fn update_trade(&self, id: Uuid, update: &TradeUpdate) -> Result<(), StoreError> {
        let affected = self
            .policy
            .retry("update_trade", StoreError::is_transient, move || async move {
                let q = match update {
                    TradeUpdate::Mark { pnl, pnl_pct, peak_price } => sqlx::query(
                        "UPDATE trades
                            SET pnl = $2, pnl_percentage = $3, peak_price = $4, updated_at = now()
                          WHERE id = $1 AND status = 'open'",
                    )
                    .bind(id)
                    .bind(*pnl)
                    .bind(*pnl_pct)
                    .bind(*peak_price),
                    TradeUpdate::Close {
                        exit_price,
                        closed_at,
                        pnl,
                        pnl_pct,
                        fees,
                        peak_price,
                        reason,
                    } => sqlx::query(
                        "UPDATE trades
                            SET status = 'closed', exit_price = $2, closed_at = $3,
                                pnl = $4, pnl_percentage = $5, fees = $6,
                                peak_price = $7, reason = $8, updated_at = now()
                          WHERE id = $1",
                    )
                    .bind(id)
                    .bind(*exit_price)
                    .bind(*closed_at)
                    .bind(*pnl)
                    .bind(*pnl_pct)
                    .bind(*fees)
                    .bind(*peak_price)
                    .bind(reason.as_str()),
                };
                q.execute(&self.pool)
                    .await
                    .map(|r| r.rows_affected())
                    .map_err(StoreError::from)
            })
            .await?;

        // a mark on a row closed elsewhere is not an error
        if affected == 0 && matches!(update, TradeUpdate::Close { .. }) {
            return Err(StoreError::MissingTrade(id));
        }
        Ok(())
    }

    async fn query_open_trade_id(
        &self,
        symbol: &str,
        config_id: &str,
    ) -> Result<Option<(Uuid, f64)>, StoreError> {
        let row: Option<(Uuid, Option<f64>, f64)> = self
            .policy
            .retry("query_open_trade_id", StoreError::is_transient, move || async move {
                sqlx::query_as(
                    "SELECT id, peak_price, entry_price
                       FROM trades
                      WHERE symbol = $1 AND config_id = $2 AND status = 'open'
                      ORDER BY opened_at DESC
                      LIMIT 1",
                )
                .bind(symbol)
                .bind(config_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::from)
            })
            .await?;
        Ok(row.map(|(id, peak, entry)| (id, peak.unwrap_or(entry))))
    }

    async fn open_trades(&self, config_id: &str) -> Result<Vec<OpenTradeRow>, StoreError> {
        self.policy
            .retry("open_trades", StoreError::is_transient, move || async move {
                sqlx::query_as::<_, OpenTradeRow>(
                    "SELECT id, symbol, strategy_label, entry_price, amount, peak_price, opened_at
                       FROM trades
                      WHERE config_id = $1 AND status = 'open'
                      ORDER BY opened_at",
                )
                .bind(config_id)
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::from)
            })
            .await
    }
}
