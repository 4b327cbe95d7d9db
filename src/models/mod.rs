use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Trade directive produced by consensus
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl Signal {
    /// Directional value: +1 buy, -1 sell, 0 hold
    pub fn value(&self) -> i8 {
        match self {
            Signal::Buy => 1,
            Signal::Sell => -1,
            Signal::Hold => 0,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Buy => write!(f, "BUY"),
            Signal::Sell => write!(f, "SELL"),
            Signal::Hold => write!(f, "HOLD"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "Buy",
            TradeAction::Sell => "Sell",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Buy" => Some(TradeAction::Buy),
            "Sell" => Some(TradeAction::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An executed order. Orders are append-only: corrections are new offsetting orders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: Uuid,
    pub ticker: String,
    pub action: TradeAction,
    pub quantity: f64,
    pub price: f64,
    pub commission: f64,
    pub timestamp: DateTime<Utc>,
    pub strategy_tag: String,
    pub reason: String,
    /// Opaque audit payload describing the reasoning behind the order
    pub thought_context: serde_json::Value,
    /// Set on sells only
    pub realized_pnl: Option<f64>,
}

impl Order {
    pub fn notional(&self) -> f64 {
        self.quantity * self.price
    }
}

/// Current holding of one ticker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub ticker: String,
    pub quantity: f64,
    /// Weighted-average fill price, commissions excluded
    pub avg_entry_price: f64,
    /// Buy commissions not yet released by a sell
    pub entry_costs: f64,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn cost_basis(&self) -> f64 {
        self.quantity * self.avg_entry_price
    }

    pub fn market_value(&self, price: f64) -> f64 {
        self.quantity * price
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.avg_entry_price) * self.quantity
    }
}

/// End-of-day account valuation, one per trading day
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BalanceSnapshot {
    pub date: NaiveDate,
    pub cash: f64,
    pub total_equity: f64,
    pub daily_pnl: f64,
    pub unrealized_pnl: f64,
}

/// Live valuation of the account from last-known prices
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AccountBalance {
    pub cash: f64,
    pub positions_value: f64,
    pub total_equity: f64,
    pub unrealized_pnl: f64,
}

/// A request to trade, as submitted to the ledger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeRequest {
    pub ticker: String,
    pub action: TradeAction,
    pub quantity: f64,
    pub price: f64,
    pub strategy: String,
    pub reason: String,
    pub thought_context: serde_json::Value,
    /// Retrying with the same key returns the original order instead of trading twice
    pub idempotency_key: Option<Uuid>,
}

impl TradeRequest {
    pub fn new(ticker: impl Into<String>, action: TradeAction, quantity: f64, price: f64) -> Self {
        Self {
            ticker: ticker.into(),
            action,
            quantity,
            price,
            strategy: "manual".to_string(),
            reason: String::new(),
            thought_context: serde_json::Value::Null,
            idempotency_key: None,
        }
    }

    pub fn buy(ticker: impl Into<String>, quantity: f64, price: f64) -> Self {
        Self::new(ticker, TradeAction::Buy, quantity, price)
    }

    pub fn sell(ticker: impl Into<String>, quantity: f64, price: f64) -> Self {
        Self::new(ticker, TradeAction::Sell, quantity, price)
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = strategy.into();
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_thought_context(mut self, context: serde_json::Value) -> Self {
        self.thought_context = context;
        self
    }

    pub fn with_idempotency_key(mut self, key: Uuid) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    /// Basic shape checks, independent of account state
    pub fn validate(&self) -> Result<(), String> {
        if self.ticker.trim().is_empty() {
            return Err("ticker is empty".to_string());
        }
        if !self.quantity.is_finite() || self.quantity <= 0.0 {
            return Err(format!("quantity must be positive, got {}", self.quantity));
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(format!("price must be positive, got {}", self.price));
        }
        Ok(())
    }
}
