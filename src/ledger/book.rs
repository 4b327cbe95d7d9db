use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::Rejection;
use crate::models::{Order, Position, TradeAction, TradeRequest};

/// Quantities at or below this are treated as zero
pub const QTY_EPSILON: f64 = 1e-9;
const CASH_TOLERANCE: f64 = 1e-6;

/// Cash and holdings of one account. Pure accounting, no I/O.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Book {
    pub cash: f64,
    pub positions: BTreeMap<String, Position>,
}

impl Book {
    pub fn new(cash: f64) -> Self {
        Self {
            cash,
            positions: BTreeMap::new(),
        }
    }

    pub fn from_parts(cash: f64, positions: Vec<Position>) -> Self {
        Self {
            cash,
            positions: positions
                .into_iter()
                .map(|p| (p.ticker.clone(), p))
                .collect(),
        }
    }

    /// Rebuild cash and holdings from the order log
    pub fn replay(initial_cash: f64, orders: &[Order]) -> Self {
        let mut book = Self::new(initial_cash);
        for order in orders {
            book.settle(order);
        }
        book
    }

    pub fn held(&self, ticker: &str) -> f64 {
        self.positions.get(ticker).map_or(0.0, |p| p.quantity)
    }

    /// Check a request against holdings and cash and price it into an order.
    /// Does not change the book.
    pub fn prepare(
        &self,
        request: &TradeRequest,
        commission_rate: f64,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Order, Rejection> {
        let notional = request.quantity * request.price;
        let commission = notional * commission_rate;

        let realized_pnl = match request.action {
            TradeAction::Sell => {
                let held = self.held(&request.ticker);
                if request.quantity > held + QTY_EPSILON {
                    return Err(Rejection::InsufficientShares {
                        ticker: request.ticker.clone(),
                        held,
                        requested: request.quantity,
                    });
                }

                let position = self.positions.get(&request.ticker).ok_or_else(|| {
                    Rejection::InsufficientShares {
                        ticker: request.ticker.clone(),
                        held,
                        requested: request.quantity,
                    }
                })?;

                let fraction = (request.quantity / position.quantity).min(1.0);
                let entry_costs = position.entry_costs * fraction;
                Some(
                    (request.price - position.avg_entry_price) * request.quantity
                        - entry_costs
                        - commission,
                )
            }
            TradeAction::Buy => {
                let required = notional + commission;
                if required > self.cash + CASH_TOLERANCE {
                    return Err(Rejection::InsufficientFunds {
                        required,
                        available: self.cash,
                    });
                }
                None
            }
        };

        Ok(Order {
            id,
            ticker: request.ticker.clone(),
            action: request.action,
            quantity: request.quantity,
            price: request.price,
            commission,
            timestamp: now,
            strategy_tag: request.strategy.clone(),
            reason: request.reason.clone(),
            thought_context: request.thought_context.clone(),
            realized_pnl,
        })
    }

    /// Apply an already-priced order
    pub fn settle(&mut self, order: &Order) {
        match order.action {
            TradeAction::Buy => {
                self.cash -= order.notional() + order.commission;

                let position = self
                    .positions
                    .entry(order.ticker.clone())
                    .or_insert_with(|| Position {
                        ticker: order.ticker.clone(),
                        quantity: 0.0,
                        avg_entry_price: 0.0,
                        entry_costs: 0.0,
                        opened_at: order.timestamp,
                        updated_at: order.timestamp,
                    });

                let quantity = position.quantity + order.quantity;
                position.avg_entry_price =
                    (position.cost_basis() + order.notional()) / quantity;
                position.quantity = quantity;
                position.entry_costs += order.commission;
                position.updated_at = order.timestamp;
            }
            TradeAction::Sell => {
                self.cash += order.notional() - order.commission;

                let closed = match self.positions.get_mut(&order.ticker) {
                    Some(position) => {
                        let fraction = (order.quantity / position.quantity).min(1.0);
                        position.entry_costs -= position.entry_costs * fraction;
                        position.quantity -= order.quantity;
                        position.updated_at = order.timestamp;
                        position.quantity <= QTY_EPSILON
                    }
                    None => false,
                };

                if closed {
                    self.positions.remove(&order.ticker);
                }
            }
        }
    }

    /// Value of all holdings, each priced by `price_of`
    pub fn market_value(&self, price_of: impl Fn(&Position) -> f64) -> f64 {
        self.positions
            .values()
            .map(|p| p.market_value(price_of(p)))
            .sum()
    }

    /// Same cash and holdings, allowing for decimal round-trips through storage
    pub fn approx_eq(&self, other: &Book) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= CASH_TOLERANCE * a.abs().max(b.abs()).max(1.0);

        close(self.cash, other.cash)
            && self.positions.len() == other.positions.len()
            && self.positions.iter().all(|(ticker, p)| {
                other.positions.get(ticker).map_or(false, |o| {
                    close(p.quantity, o.quantity)
                        && close(p.avg_entry_price, o.avg_entry_price)
                        && close(p.entry_costs, o.entry_costs)
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(book: &mut Book, request: TradeRequest, rate: f64) -> Order {
        let order = book
            .prepare(&request, rate, Uuid::new_v4(), Utc::now())
            .unwrap();
        book.settle(&order);
        order
    }

    #[test]
    fn test_round_trip_with_commission() {
        let mut book = Book::new(200_000.0);

        fill(&mut book, TradeRequest::buy("ACME", 100.0, 1000.0), 0.001);
        let sell = fill(&mut book, TradeRequest::sell("ACME", 100.0, 1100.0), 0.001);

        let pnl = sell.realized_pnl.unwrap();
        assert!((pnl - 9_790.0).abs() < 1e-6);
        assert!((book.cash - 209_790.0).abs() < 1e-6);
        assert!(book.positions.is_empty());
    }

    #[test]
    fn test_weighted_average_entry() {
        let mut book = Book::new(10_000.0);

        fill(&mut book, TradeRequest::buy("ACME", 10.0, 100.0), 0.0);
        fill(&mut book, TradeRequest::buy("ACME", 30.0, 120.0), 0.0);

        let position = &book.positions["ACME"];
        assert_eq!(position.quantity, 40.0);
        assert!((position.avg_entry_price - 115.0).abs() < 1e-9);
    }

    #[test]
    fn test_partial_sell_releases_costs_pro_rata() {
        let mut book = Book::new(10_000.0);

        fill(&mut book, TradeRequest::buy("ACME", 10.0, 100.0), 0.001);
        let sell = fill(&mut book, TradeRequest::sell("ACME", 4.0, 110.0), 0.001);

        // 4 * 10 gain - 0.4 of the 1.0 entry commission - 0.44 exit commission
        assert!((sell.realized_pnl.unwrap() - 39.16).abs() < 1e-9);
        let position = &book.positions["ACME"];
        assert!((position.quantity - 6.0).abs() < 1e-12);
        assert!((position.entry_costs - 0.6).abs() < 1e-12);
        assert_eq!(position.avg_entry_price, 100.0);
    }

    #[test]
    fn test_prepare_rejects_naked_short() {
        let book = Book::new(10_000.0);

        let result = book.prepare(
            &TradeRequest::sell("ACME", 1.0, 100.0),
            0.0,
            Uuid::new_v4(),
            Utc::now(),
        );

        assert!(matches!(
            result,
            Err(Rejection::InsufficientShares { held, .. }) if held == 0.0
        ));
    }

    #[test]
    fn test_prepare_counts_commission_against_cash() {
        let book = Book::new(1_000.0);

        let result = book.prepare(
            &TradeRequest::buy("ACME", 10.0, 100.0),
            0.001,
            Uuid::new_v4(),
            Utc::now(),
        );

        assert!(matches!(result, Err(Rejection::InsufficientFunds { .. })));
    }

    #[test]
    fn test_replay_matches_incremental_settlement() {
        let mut book = Book::new(50_000.0);
        let orders = vec![
            fill(&mut book, TradeRequest::buy("A", 10.0, 100.0), 0.001),
            fill(&mut book, TradeRequest::buy("B", 5.0, 300.0), 0.001),
            fill(&mut book, TradeRequest::sell("A", 3.0, 105.0), 0.001),
            fill(&mut book, TradeRequest::buy("A", 2.0, 98.0), 0.001),
            fill(&mut book, TradeRequest::sell("B", 5.0, 290.0), 0.001),
        ];

        let replayed = Book::replay(50_000.0, &orders);

        assert!(replayed.approx_eq(&book));
        assert!(!replayed.positions.contains_key("B"));
    }
}
