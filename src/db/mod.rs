//! Durable storage for ledger and circuit breaker state.
//!
//! Two backends implement the same traits: Postgres for real accounts and an
//! in-memory store for tests and ephemeral paper sessions.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::models::{BalanceSnapshot, Order, Position};
use crate::risk::circuit_breakers::BreakerRecord;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Cash record of one account
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountRecord {
    pub initial_cash: f64,
    pub cash: f64,
}

/// Everything one accepted trade changes, written as a single unit
#[derive(Debug, Clone, Copy)]
pub struct FillRecord<'a> {
    pub order: &'a Order,
    /// Position after the fill; `None` means the position was closed
    pub position: Option<&'a Position>,
    pub cash_after: f64,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create the account if missing and return its current cash record
    async fn init_account(
        &self,
        account_id: &str,
        initial_cash: f64,
    ) -> Result<AccountRecord, StoreError>;

    /// All orders of the account, oldest first
    async fn load_orders(&self, account_id: &str) -> Result<Vec<Order>, StoreError>;

    async fn load_positions(&self, account_id: &str) -> Result<Vec<Position>, StoreError>;

    /// Append the order, upsert or delete the position and set cash atomically
    async fn commit_fill(&self, account_id: &str, fill: &FillRecord<'_>)
        -> Result<(), StoreError>;

    /// Insert or replace the snapshot for its date
    async fn save_snapshot(
        &self,
        account_id: &str,
        snapshot: &BalanceSnapshot,
    ) -> Result<(), StoreError>;

    /// Latest snapshot strictly before `before`
    async fn previous_snapshot(
        &self,
        account_id: &str,
        before: NaiveDate,
    ) -> Result<Option<BalanceSnapshot>, StoreError>;

    /// Most recent snapshots, newest first
    async fn load_snapshots(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<BalanceSnapshot>, StoreError>;
}

#[async_trait]
pub trait BreakerStore: Send + Sync {
    async fn load_breaker(&self, account_id: &str) -> Result<Option<BreakerRecord>, StoreError>;

    async fn save_breaker(&self, account_id: &str, record: &BreakerRecord)
        -> Result<(), StoreError>;
}
