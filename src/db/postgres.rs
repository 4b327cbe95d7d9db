use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use super::{AccountRecord, BreakerStore, FillRecord, LedgerStore, StoreError};
use crate::models::{BalanceSnapshot, Order, Position, TradeAction};
use crate::risk::circuit_breakers::{BreakerRecord, CircuitBreakerConfig, CircuitBreakerState};

// Shortest decimal text of the f64, so NUMERIC holds what the ledger computed
fn to_decimal(field: &str, value: f64) -> Result<Decimal, StoreError> {
    if !value.is_finite() {
        return Err(StoreError::InvalidData(format!("{} is not finite: {}", field, value)));
    }
    value
        .to_string()
        .parse()
        .map_err(|e| StoreError::InvalidData(format!("{} {} is not representable: {}", field, value, e)))
}

fn to_f64(field: &str, value: Decimal) -> Result<f64, StoreError> {
    value
        .to_string()
        .parse()
        .map_err(|e| StoreError::InvalidData(format!("{} {} out of range: {}", field, value, e)))
}

/// Postgres-backed ledger and breaker storage
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to Postgres and run pending migrations
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn order_from_row(row: &sqlx::postgres::PgRow) -> Result<Order, StoreError> {
        let action_str: String = row.get("action");
        let action = TradeAction::parse(&action_str)
            .ok_or_else(|| StoreError::InvalidData(format!("invalid order action {}", action_str)))?;
        let realized_pnl: Option<Decimal> = row.get("realized_pnl");
        let thought_context: Json<serde_json::Value> = row.get("thought_context");

        Ok(Order {
            id: row.get("id"),
            ticker: row.get("ticker"),
            action,
            quantity: to_f64("quantity", row.get("quantity"))?,
            price: to_f64("price", row.get("price"))?,
            commission: to_f64("commission", row.get("commission"))?,
            timestamp: row.get("executed_at"),
            strategy_tag: row.get("strategy_tag"),
            reason: row.get("reason"),
            thought_context: thought_context.0,
            realized_pnl: realized_pnl.map(|v| to_f64("realized_pnl", v)).transpose()?,
        })
    }

    fn snapshot_from_row(row: &sqlx::postgres::PgRow) -> Result<BalanceSnapshot, StoreError> {
        Ok(BalanceSnapshot {
            date: row.get("snapshot_date"),
            cash: to_f64("cash", row.get("cash"))?,
            total_equity: to_f64("total_equity", row.get("total_equity"))?,
            daily_pnl: to_f64("daily_pnl", row.get("daily_pnl"))?,
            unrealized_pnl: to_f64("unrealized_pnl", row.get("unrealized_pnl"))?,
        })
    }
}

#[async_trait]
impl LedgerStore for PostgresStore {
    async fn init_account(
        &self,
        account_id: &str,
        initial_cash: f64,
    ) -> Result<AccountRecord, StoreError> {
        let initial = to_decimal("initial_cash", initial_cash)?;

        sqlx::query(
            r#"
            INSERT INTO accounts (account_id, initial_cash, cash)
            VALUES ($1, $2, $2)
            ON CONFLICT (account_id) DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(initial)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT initial_cash, cash FROM accounts WHERE account_id = $1")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(AccountRecord {
            initial_cash: to_f64("initial_cash", row.get("initial_cash"))?,
            cash: to_f64("cash", row.get("cash"))?,
        })
    }

    async fn load_orders(&self, account_id: &str) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, ticker, action, quantity, price, commission, realized_pnl,
                   strategy_tag, reason, thought_context, executed_at
            FROM orders
            WHERE account_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        let orders = rows
            .iter()
            .map(Self::order_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!("Loaded {} orders for {} from Postgres", orders.len(), account_id);

        Ok(orders)
    }

    async fn load_positions(&self, account_id: &str) -> Result<Vec<Position>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT ticker, quantity, avg_entry_price, entry_costs, opened_at, updated_at
            FROM positions
            WHERE account_id = $1
            ORDER BY ticker ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in rows {
            let opened_at: DateTime<Utc> = row.get("opened_at");
            let updated_at: DateTime<Utc> = row.get("updated_at");

            positions.push(Position {
                ticker: row.get("ticker"),
                quantity: to_f64("quantity", row.get("quantity"))?,
                avg_entry_price: to_f64("avg_entry_price", row.get("avg_entry_price"))?,
                entry_costs: to_f64("entry_costs", row.get("entry_costs"))?,
                opened_at,
                updated_at,
            });
        }

        Ok(positions)
    }

    async fn commit_fill(
        &self,
        account_id: &str,
        fill: &FillRecord<'_>,
    ) -> Result<(), StoreError> {
        let order = fill.order;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders (
                id, account_id, ticker, action, quantity, price, commission,
                realized_pnl, strategy_tag, reason, thought_context, executed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(order.id)
        .bind(account_id)
        .bind(&order.ticker)
        .bind(order.action.as_str())
        .bind(to_decimal("quantity", order.quantity)?)
        .bind(to_decimal("price", order.price)?)
        .bind(to_decimal("commission", order.commission)?)
        .bind(
            order
                .realized_pnl
                .map(|v| to_decimal("realized_pnl", v))
                .transpose()?,
        )
        .bind(&order.strategy_tag)
        .bind(&order.reason)
        .bind(Json(&order.thought_context))
        .bind(order.timestamp)
        .execute(&mut *tx)
        .await?;

        match fill.position {
            Some(position) => {
                sqlx::query(
                    r#"
                    INSERT INTO positions (
                        account_id, ticker, quantity, avg_entry_price, entry_costs,
                        opened_at, updated_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (account_id, ticker) DO UPDATE SET
                        quantity = EXCLUDED.quantity,
                        avg_entry_price = EXCLUDED.avg_entry_price,
                        entry_costs = EXCLUDED.entry_costs,
                        updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(account_id)
                .bind(&position.ticker)
                .bind(to_decimal("quantity", position.quantity)?)
                .bind(to_decimal("avg_entry_price", position.avg_entry_price)?)
                .bind(to_decimal("entry_costs", position.entry_costs)?)
                .bind(position.opened_at)
                .bind(position.updated_at)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM positions WHERE account_id = $1 AND ticker = $2")
                    .bind(account_id)
                    .bind(&order.ticker)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        let updated = sqlx::query(
            "UPDATE accounts SET cash = $2, updated_at = NOW() WHERE account_id = $1",
        )
        .bind(account_id)
        .bind(to_decimal("cash", fill.cash_after)?)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            // Dropping the transaction rolls it back
            return Err(StoreError::InvalidData(format!("unknown account {}", account_id)));
        }

        tx.commit().await?;

        tracing::debug!(
            "Committed {} {} x {} for {}",
            order.action,
            order.ticker,
            order.quantity,
            account_id
        );

        Ok(())
    }

    async fn save_snapshot(
        &self,
        account_id: &str,
        snapshot: &BalanceSnapshot,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO balance_snapshots (
                account_id, snapshot_date, cash, total_equity, daily_pnl, unrealized_pnl
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (account_id, snapshot_date) DO UPDATE SET
                cash = EXCLUDED.cash,
                total_equity = EXCLUDED.total_equity,
                daily_pnl = EXCLUDED.daily_pnl,
                unrealized_pnl = EXCLUDED.unrealized_pnl,
                updated_at = NOW()
            "#,
        )
        .bind(account_id)
        .bind(snapshot.date)
        .bind(to_decimal("cash", snapshot.cash)?)
        .bind(to_decimal("total_equity", snapshot.total_equity)?)
        .bind(to_decimal("daily_pnl", snapshot.daily_pnl)?)
        .bind(to_decimal("unrealized_pnl", snapshot.unrealized_pnl)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn previous_snapshot(
        &self,
        account_id: &str,
        before: NaiveDate,
    ) -> Result<Option<BalanceSnapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT snapshot_date, cash, total_equity, daily_pnl, unrealized_pnl
            FROM balance_snapshots
            WHERE account_id = $1 AND snapshot_date < $2
            ORDER BY snapshot_date DESC
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .bind(before)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::snapshot_from_row).transpose()
    }

    async fn load_snapshots(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<BalanceSnapshot>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT snapshot_date, cash, total_equity, daily_pnl, unrealized_pnl
            FROM balance_snapshots
            WHERE account_id = $1
            ORDER BY snapshot_date DESC
            LIMIT $2
            "#,
        )
        .bind(account_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::snapshot_from_row).collect()
    }
}

#[async_trait]
impl BreakerStore for PostgresStore {
    async fn load_breaker(&self, account_id: &str) -> Result<Option<BreakerRecord>, StoreError> {
        let row = sqlx::query("SELECT config, state FROM circuit_breakers WHERE account_id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| {
            let config: Json<CircuitBreakerConfig> = row.get("config");
            let state: Json<CircuitBreakerState> = row.get("state");
            BreakerRecord {
                config: config.0,
                state: state.0,
            }
        }))
    }

    async fn save_breaker(
        &self,
        account_id: &str,
        record: &BreakerRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO circuit_breakers (account_id, config, state)
            VALUES ($1, $2, $3)
            ON CONFLICT (account_id) DO UPDATE SET
                config = EXCLUDED.config,
                state = EXCLUDED.state,
                updated_at = NOW()
            "#,
        )
        .bind(account_id)
        .bind(Json(&record.config))
        .bind(Json(&record.state))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
