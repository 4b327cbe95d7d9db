use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{AccountRecord, BreakerStore, FillRecord, LedgerStore, StoreError};
use crate::models::{BalanceSnapshot, Order, Position};
use crate::risk::circuit_breakers::BreakerRecord;

#[derive(Default)]
struct MemoryInner {
    accounts: HashMap<String, AccountRecord>,
    orders: HashMap<String, Vec<Order>>,
    positions: HashMap<String, BTreeMap<String, Position>>,
    snapshots: HashMap<String, BTreeMap<NaiveDate, BalanceSnapshot>>,
    breakers: HashMap<String, BreakerRecord>,
}

/// In-process store. Nothing survives the process.
///
/// Writes can be made to fail on demand, which is how the tests exercise the
/// "failed write leaves prior state intact" paths.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    failing_writes: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` write calls fail with `StoreError::Unavailable`
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of successful write calls so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn begin_write(&self) -> Result<(), StoreError> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn init_account(
        &self,
        account_id: &str,
        initial_cash: f64,
    ) -> Result<AccountRecord, StoreError> {
        let mut inner = self.lock()?;
        let record = *inner
            .accounts
            .entry(account_id.to_string())
            .or_insert(AccountRecord {
                initial_cash,
                cash: initial_cash,
            });
        Ok(record)
    }

    async fn load_orders(&self, account_id: &str) -> Result<Vec<Order>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.orders.get(account_id).cloned().unwrap_or_default())
    }

    async fn load_positions(&self, account_id: &str) -> Result<Vec<Position>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .positions
            .get(account_id)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn commit_fill(
        &self,
        account_id: &str,
        fill: &FillRecord<'_>,
    ) -> Result<(), StoreError> {
        self.begin_write()?;
        let mut inner = self.lock()?;

        let duplicate = inner
            .orders
            .get(account_id)
            .map_or(false, |orders| orders.iter().any(|o| o.id == fill.order.id));
        if duplicate {
            return Err(StoreError::InvalidData(format!(
                "order {} already recorded for {}",
                fill.order.id, account_id
            )));
        }

        let account = inner
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| StoreError::InvalidData(format!("unknown account {}", account_id)))?;
        account.cash = fill.cash_after;

        let ticker = fill.order.ticker.clone();
        let positions = inner.positions.entry(account_id.to_string()).or_default();
        match fill.position {
            Some(position) => {
                positions.insert(ticker, position.clone());
            }
            None => {
                positions.remove(&ticker);
            }
        }

        inner
            .orders
            .entry(account_id.to_string())
            .or_default()
            .push(fill.order.clone());

        Ok(())
    }

    async fn save_snapshot(
        &self,
        account_id: &str,
        snapshot: &BalanceSnapshot,
    ) -> Result<(), StoreError> {
        self.begin_write()?;
        let mut inner = self.lock()?;
        inner
            .snapshots
            .entry(account_id.to_string())
            .or_default()
            .insert(snapshot.date, snapshot.clone());
        Ok(())
    }

    async fn previous_snapshot(
        &self,
        account_id: &str,
        before: NaiveDate,
    ) -> Result<Option<BalanceSnapshot>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .snapshots
            .get(account_id)
            .and_then(|s| s.range(..before).next_back())
            .map(|(_, snapshot)| snapshot.clone()))
    }

    async fn load_snapshots(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<BalanceSnapshot>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .snapshots
            .get(account_id)
            .map(|s| s.values().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl BreakerStore for MemoryStore {
    async fn load_breaker(&self, account_id: &str) -> Result<Option<BreakerRecord>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.breakers.get(account_id).cloned())
    }

    async fn save_breaker(
        &self,
        account_id: &str,
        record: &BreakerRecord,
    ) -> Result<(), StoreError> {
        self.begin_write()?;
        let mut inner = self.lock()?;
        inner
            .breakers
            .insert(account_id.to_string(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeAction;
    use chrono::Utc;
    use uuid::Uuid;

    fn order(ticker: &str) -> Order {
        Order {
            id: Uuid::new_v4(),
            ticker: ticker.to_string(),
            action: TradeAction::Buy,
            quantity: 1.0,
            price: 10.0,
            commission: 0.0,
            timestamp: Utc::now(),
            strategy_tag: "test".to_string(),
            reason: String::new(),
            thought_context: serde_json::Value::Null,
            realized_pnl: None,
        }
    }

    #[tokio::test]
    async fn test_init_account_is_idempotent() {
        let store = MemoryStore::new();
        let first = store.init_account("acct", 1000.0).await.unwrap();
        let second = store.init_account("acct", 5000.0).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.initial_cash, 1000.0);
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_store_untouched() {
        let store = MemoryStore::new();
        store.init_account("acct", 1000.0).await.unwrap();
        store.fail_next_writes(1);

        let order = order("AAPL");
        let fill = FillRecord {
            order: &order,
            position: None,
            cash_after: 990.0,
        };

        assert!(store.commit_fill("acct", &fill).await.is_err());
        assert!(store.load_orders("acct").await.unwrap().is_empty());
        assert_eq!(store.init_account("acct", 0.0).await.unwrap().cash, 1000.0);

        // Next write goes through
        store.commit_fill("acct", &fill).await.unwrap();
        assert_eq!(store.load_orders("acct").await.unwrap().len(), 1);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_order_ids_are_unique_per_account() {
        let store = MemoryStore::new();
        store.init_account("a", 1000.0).await.unwrap();
        store.init_account("b", 1000.0).await.unwrap();

        let order = order("AAPL");
        let fill = FillRecord {
            order: &order,
            position: None,
            cash_after: 990.0,
        };

        store.commit_fill("a", &fill).await.unwrap();
        // Same id under another account is a different order
        store.commit_fill("b", &fill).await.unwrap();

        let again = FillRecord {
            order: &order,
            position: None,
            cash_after: 980.0,
        };
        assert!(store.commit_fill("a", &again).await.is_err());
        assert_eq!(store.load_orders("a").await.unwrap().len(), 1);
        assert_eq!(store.init_account("a", 0.0).await.unwrap().cash, 990.0);
    }

    #[tokio::test]
    async fn test_previous_snapshot_is_strictly_before() {
        let store = MemoryStore::new();
        let day = |d| NaiveDate::from_ymd_opt(2026, 3, d).unwrap();
        for d in [1, 2, 3] {
            store
                .save_snapshot(
                    "acct",
                    &BalanceSnapshot {
                        date: day(d),
                        cash: 0.0,
                        total_equity: d as f64,
                        daily_pnl: 0.0,
                        unrealized_pnl: 0.0,
                    },
                )
                .await
                .unwrap();
        }

        let prev = store.previous_snapshot("acct", day(3)).await.unwrap().unwrap();
        assert_eq!(prev.date, day(2));
        assert!(store.previous_snapshot("acct", day(1)).await.unwrap().is_none());

        let recent = store.load_snapshots("acct", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].date, day(3));
    }
}
