//! Trade ledger: the only writer of cash, positions, orders and balance
//! snapshots for one account.
//!
//! Writes are serialized behind an async mutex and go to the store before
//! they become visible. Reads are served from an in-memory view that only
//! ever holds committed state.

pub mod book;

pub use book::Book;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::{FillRecord, LedgerStore, StoreError};
use crate::market::PriceBook;
use crate::models::{
    AccountBalance, BalanceSnapshot, Order, Position, TradeAction, TradeRequest,
};
use crate::risk::{BreakerError, CircuitBreaker};
use book::QTY_EPSILON;

/// Why a trade request was refused. Rejections change no state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "code")]
pub enum Rejection {
    #[serde(rename = "CIRCUIT_OPEN")]
    CircuitOpen { reason: String },

    #[serde(rename = "INSUFFICIENT_SHARES")]
    InsufficientShares {
        ticker: String,
        held: f64,
        requested: f64,
    },

    #[serde(rename = "INSUFFICIENT_FUNDS")]
    InsufficientFunds { required: f64, available: f64 },

    #[serde(rename = "INVALID_ORDER")]
    InvalidOrder { reason: String },
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Rejection::InsufficientShares { .. } => "INSUFFICIENT_SHARES",
            Rejection::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Rejection::InvalidOrder { .. } => "INVALID_ORDER",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::CircuitOpen { reason } => write!(f, "CIRCUIT_OPEN: {}", reason),
            Rejection::InsufficientShares {
                ticker,
                held,
                requested,
            } => write!(
                f,
                "INSUFFICIENT_SHARES: {} held {}, requested {}",
                ticker, held, requested
            ),
            Rejection::InsufficientFunds {
                required,
                available,
            } => write!(
                f,
                "INSUFFICIENT_FUNDS: need ${:.2}, have ${:.2}",
                required, available
            ),
            Rejection::InvalidOrder { reason } => write!(f, "INVALID_ORDER: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TradeOutcome {
    Filled(Order),
    Rejected(Rejection),
}

impl TradeOutcome {
    pub fn order(&self) -> Option<&Order> {
        match self {
            TradeOutcome::Filled(order) => Some(order),
            TradeOutcome::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            TradeOutcome::Filled(_) => None,
            TradeOutcome::Rejected(rejection) => Some(rejection),
        }
    }

    pub fn is_filled(&self) -> bool {
        matches!(self, TradeOutcome::Filled(_))
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger write failed: {0}")]
    Persistence(#[from] StoreError),

    #[error(transparent)]
    Breaker(#[from] BreakerError),

    #[error("ledger is inconsistent: {0}")]
    Inconsistent(String),

    #[error("invalid ledger config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub account_id: String,
    /// Only used when the account is created; afterwards the stored value wins
    pub initial_cash: f64,
    /// Fraction of notional charged on every fill (0.001 = 0.1%)
    pub commission_rate: f64,
}

impl LedgerConfig {
    fn validate(&self) -> Result<(), LedgerError> {
        if self.account_id.trim().is_empty() {
            return Err(LedgerError::InvalidConfig("account_id is empty".to_string()));
        }
        if !self.initial_cash.is_finite() || self.initial_cash < 0.0 {
            return Err(LedgerError::InvalidConfig(format!(
                "initial_cash must be non-negative, got {}",
                self.initial_cash
            )));
        }
        if !self.commission_rate.is_finite()
            || self.commission_rate < 0.0
            || self.commission_rate >= 1.0
        {
            return Err(LedgerError::InvalidConfig(format!(
                "commission_rate must be in [0, 1), got {}",
                self.commission_rate
            )));
        }
        Ok(())
    }
}

struct LedgerView {
    initial_cash: f64,
    book: Book,
    orders: Vec<Order>,
}

pub struct TradeLedger {
    account_id: String,
    commission_rate: f64,
    store: Arc<dyn LedgerStore>,
    breaker: Arc<CircuitBreaker>,
    prices: Arc<PriceBook>,
    writer: Mutex<()>,
    view: RwLock<LedgerView>,
}

impl TradeLedger {
    /// Load the account from the store, creating it on first use.
    ///
    /// Stored cash and positions must agree with a replay of the order log,
    /// otherwise the ledger refuses to open.
    pub async fn open(
        config: LedgerConfig,
        store: Arc<dyn LedgerStore>,
        breaker: Arc<CircuitBreaker>,
        prices: Arc<PriceBook>,
    ) -> Result<Self, LedgerError> {
        config.validate()?;

        let account = store
            .init_account(&config.account_id, config.initial_cash)
            .await?;
        if (account.initial_cash - config.initial_cash).abs() > f64::EPSILON {
            tracing::info!(
                "Account {} already exists with initial cash ${:.2}, ignoring configured ${:.2}",
                config.account_id, account.initial_cash, config.initial_cash
            );
        }

        let orders = store.load_orders(&config.account_id).await?;
        let positions = store.load_positions(&config.account_id).await?;

        let replayed = Book::replay(account.initial_cash, &orders);
        let stored = Book::from_parts(account.cash, positions);
        if !replayed.approx_eq(&stored) {
            return Err(LedgerError::Inconsistent(format!(
                "account {}: stored cash ${:.2} with {} positions, order log gives ${:.2} with {} positions",
                config.account_id,
                stored.cash,
                stored.positions.len(),
                replayed.cash,
                replayed.positions.len()
            )));
        }

        // Last fill price is the best we know until the feed answers
        for order in orders.iter().rev() {
            if prices.last_known(&order.ticker).is_none() {
                prices.record(&order.ticker, order.price);
            }
        }

        tracing::info!(
            "Opened ledger {}: cash ${:.2}, {} positions, {} orders",
            config.account_id,
            replayed.cash,
            replayed.positions.len(),
            orders.len()
        );

        Ok(Self {
            account_id: config.account_id,
            commission_rate: config.commission_rate,
            store,
            breaker,
            prices,
            writer: Mutex::new(()),
            view: RwLock::new(LedgerView {
                initial_cash: account.initial_cash,
                book: replayed,
                orders,
            }),
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn prices(&self) -> &Arc<PriceBook> {
        &self.prices
    }

    fn read_view(&self) -> RwLockReadGuard<'_, LedgerView> {
        self.view.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_view(&self) -> RwLockWriteGuard<'_, LedgerView> {
        self.view.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate and record a trade.
    ///
    /// Business refusals come back as `Ok(TradeOutcome::Rejected)`; an `Err`
    /// means the store could not be written and nothing changed.
    pub async fn execute_trade(&self, request: TradeRequest) -> Result<TradeOutcome, LedgerError> {
        let _writer = self.writer.lock().await;
        self.execute_locked(&request).await
    }

    async fn execute_locked(&self, request: &TradeRequest) -> Result<TradeOutcome, LedgerError> {
        if let Some(key) = request.idempotency_key {
            let existing = self.read_view().orders.iter().find(|o| o.id == key).cloned();
            if let Some(order) = existing {
                tracing::info!("Request {} already filled, returning existing order", key);
                return Ok(TradeOutcome::Filled(order));
            }
        }

        if let Err(reason) = request.validate() {
            return Ok(self.reject(request, Rejection::InvalidOrder { reason }));
        }

        let (allowed, reason) = self.breaker.can_execute().await;
        if !allowed {
            return Ok(self.reject(request, Rejection::CircuitOpen { reason }));
        }

        let id = request.idempotency_key.unwrap_or_else(Uuid::new_v4);
        let prepared = {
            let view = self.read_view();
            view.book
                .prepare(request, self.commission_rate, id, Utc::now())
                .map(|order| {
                    let mut next = view.book.clone();
                    next.settle(&order);
                    (order, next)
                })
        };

        let (order, next) = match prepared {
            Ok(prepared) => prepared,
            Err(rejection) => return Ok(self.reject(request, rejection)),
        };

        let fill = FillRecord {
            order: &order,
            position: next.positions.get(&order.ticker),
            cash_after: next.cash,
        };
        if let Err(e) = self.store.commit_fill(&self.account_id, &fill).await {
            tracing::error!(
                "Failed to record {} {} x {}: {}",
                order.action, order.ticker, order.quantity, e
            );
            return Err(e.into());
        }

        let cash_after = next.cash;
        {
            let mut view = self.write_view();
            view.book = next;
            view.orders.push(order.clone());
        }
        self.prices.record(&order.ticker, order.price);

        match order.realized_pnl {
            Some(pnl) => tracing::info!(
                "📝 {} {} x {} @ ${:.2} (commission ${:.2}, realized ${:.2}), cash ${:.2}",
                order.action, order.ticker, order.quantity, order.price, order.commission, pnl, cash_after
            ),
            None => tracing::info!(
                "📝 {} {} x {} @ ${:.2} (commission ${:.2}), cash ${:.2}",
                order.action, order.ticker, order.quantity, order.price, order.commission, cash_after
            ),
        }

        if let Some(pnl) = order.realized_pnl {
            self.feed_breaker(pnl).await;
        }

        Ok(TradeOutcome::Filled(order))
    }

    /// Report a realized result to the breaker. The fill is already durable,
    /// so a breaker failure is logged rather than returned; the breaker fails
    /// closed on its own.
    async fn feed_breaker(&self, realized_pnl: f64) {
        let result = if realized_pnl < 0.0 {
            self.breaker.record_loss(-realized_pnl).await.map(|_| ())
        } else if realized_pnl > 0.0 {
            self.breaker.record_success().await
        } else {
            Ok(())
        };

        if let Err(e) = result {
            tracing::error!("Circuit breaker did not record realized ${:.2}: {}", realized_pnl, e);
        }
    }

    fn reject(&self, request: &TradeRequest, rejection: Rejection) -> TradeOutcome {
        tracing::warn!(
            "🚫 Rejected {} {} x {} @ {}: {}",
            request.action, request.ticker, request.quantity, request.price, rejection
        );
        TradeOutcome::Rejected(rejection)
    }

    pub fn get_positions(&self) -> Vec<Position> {
        self.read_view().book.positions.values().cloned().collect()
    }

    pub fn get_position(&self, ticker: &str) -> Option<Position> {
        self.read_view().book.positions.get(ticker).cloned()
    }

    /// Orders oldest first; with a limit, only the most recent `limit`
    pub fn get_trade_history(&self, limit: Option<usize>) -> Vec<Order> {
        let view = self.read_view();
        let start = limit.map_or(0, |limit| view.orders.len().saturating_sub(limit));
        view.orders[start..].to_vec()
    }

    pub fn cash(&self) -> f64 {
        self.read_view().book.cash
    }

    pub fn initial_cash(&self) -> f64 {
        self.read_view().initial_cash
    }

    /// Live valuation from last-known prices, falling back to entry price
    pub fn get_current_balance(&self) -> AccountBalance {
        let view = self.read_view();
        let price_of = |p: &Position| self.prices.valuation_price(&p.ticker, p.avg_entry_price);

        let positions_value = view.book.market_value(price_of);
        let unrealized_pnl = view
            .book
            .positions
            .values()
            .map(|p| p.unrealized_pnl(price_of(p)))
            .sum();

        AccountBalance {
            cash: view.book.cash,
            positions_value,
            total_equity: view.book.cash + positions_value,
            unrealized_pnl,
        }
    }

    /// Rebuild today's balance snapshot from the order log and store it
    pub async fn recalculate_balance(&self) -> Result<BalanceSnapshot, LedgerError> {
        self.recalculate_balance_at(Utc::now().date_naive()).await
    }

    /// Rebuild the snapshot for `date` from the order log and store it.
    ///
    /// Positions are valued at last-known prices and the feed is not queried,
    /// so running it twice without trades in between stores the same snapshot.
    /// Call [`TradeLedger::refresh_prices`] first to value at fresh quotes.
    pub async fn recalculate_balance_at(
        &self,
        date: NaiveDate,
    ) -> Result<BalanceSnapshot, LedgerError> {
        let _writer = self.writer.lock().await;

        let (initial_cash, replayed) = {
            let view = self.read_view();
            let replayed = Book::replay(view.initial_cash, &view.orders);
            if !replayed.approx_eq(&view.book) {
                return Err(LedgerError::Inconsistent(format!(
                    "account {}: in-memory book ${:.2} drifted from order log ${:.2}",
                    self.account_id, view.book.cash, replayed.cash
                )));
            }
            (view.initial_cash, replayed)
        };

        let mut positions_value = 0.0;
        let mut unrealized_pnl = 0.0;
        for position in replayed.positions.values() {
            let price = self
                .prices
                .valuation_price(&position.ticker, position.avg_entry_price);
            positions_value += position.market_value(price);
            unrealized_pnl += position.unrealized_pnl(price);
        }

        let total_equity = replayed.cash + positions_value;
        let baseline = self
            .store
            .previous_snapshot(&self.account_id, date)
            .await?
            .map_or(initial_cash, |s| s.total_equity);

        let snapshot = BalanceSnapshot {
            date,
            cash: replayed.cash,
            total_equity,
            daily_pnl: total_equity - baseline,
            unrealized_pnl,
        };
        self.store.save_snapshot(&self.account_id, &snapshot).await?;

        tracing::info!(
            "💰 Balance {} for {}: equity ${:.2}, cash ${:.2}, daily P&L ${:.2}",
            date, self.account_id, snapshot.total_equity, snapshot.cash, snapshot.daily_pnl
        );

        Ok(snapshot)
    }

    /// Quote every held ticker. Runs outside the writer lock.
    pub async fn refresh_prices(&self) {
        let tickers: Vec<String> = self.read_view().book.positions.keys().cloned().collect();
        self.prices.refresh(tickers.iter().map(String::as_str)).await;
    }

    /// Refresh quotes, recalculate today's snapshot and feed its equity to the
    /// drawdown check
    pub async fn update_daily_equity(&self) -> Result<BalanceSnapshot, LedgerError> {
        self.refresh_prices().await;
        let snapshot = self.recalculate_balance().await?;
        self.breaker.record_equity(snapshot.total_equity).await?;
        Ok(snapshot)
    }

    pub async fn load_snapshots(&self, limit: usize) -> Result<Vec<BalanceSnapshot>, LedgerError> {
        Ok(self.store.load_snapshots(&self.account_id, limit).await?)
    }

    /// Trade each listed ticker to its target quantity at the current quote.
    ///
    /// Sells run before buys so freed cash can fund the buys. Each leg is its
    /// own atomic fill; a write failure stops the remaining legs.
    pub async fn rebalance(
        &self,
        targets: &BTreeMap<String, f64>,
        strategy: &str,
        reason: &str,
    ) -> Result<Vec<TradeOutcome>, LedgerError> {
        let _writer = self.writer.lock().await;

        let mut outcomes = Vec::new();
        let mut sells = Vec::new();
        let mut buys = Vec::new();

        for (ticker, &target) in targets {
            if !target.is_finite() || target < 0.0 {
                let rejection = Rejection::InvalidOrder {
                    reason: format!("target quantity for {} must be non-negative, got {}", ticker, target),
                };
                tracing::warn!("🚫 Rebalance skipped {}: {}", ticker, rejection);
                outcomes.push(TradeOutcome::Rejected(rejection));
                continue;
            }

            let held = self.read_view().book.held(ticker);
            let delta = target - held;
            if delta.abs() <= QTY_EPSILON {
                continue;
            }

            let Some(price) = self.prices.quote(ticker).await else {
                let rejection = Rejection::InvalidOrder {
                    reason: format!("no price available for {}", ticker),
                };
                tracing::warn!("🚫 Rebalance skipped {}: {}", ticker, rejection);
                outcomes.push(TradeOutcome::Rejected(rejection));
                continue;
            };

            let action = if delta > 0.0 {
                TradeAction::Buy
            } else {
                TradeAction::Sell
            };
            let request = TradeRequest::new(ticker.clone(), action, delta.abs(), price)
                .with_strategy(strategy)
                .with_reason(reason)
                .with_thought_context(serde_json::json!({
                    "rebalance_target": target,
                    "held_before": held,
                }));

            match action {
                TradeAction::Sell => sells.push(request),
                TradeAction::Buy => buys.push(request),
            }
        }

        for request in sells.iter().chain(buys.iter()) {
            outcomes.push(self.execute_locked(request).await?);
        }

        Ok(outcomes)
    }
}
