//! Decision and circuit breaker events for UI / notification consumers.
//!
//! Delivery is fire-and-forget over tokio broadcast channels; consumers that
//! fall behind lose the oldest events, never block the publisher.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::ledger::Rejection;
use crate::models::{Order, Signal};
use crate::risk::{BreakerState, BreakerTrigger};

const DEFAULT_CAPACITY: usize = 256;

/// Outcome of one decision cycle for one ticker
#[derive(Debug, Clone, Serialize)]
pub struct DecisionEvent {
    pub ticker: String,
    pub signal: Signal,
    pub consensus_score: f64,
    pub order: Option<Order>,
    pub rejection: Option<Rejection>,
    /// Why no order was attempted, when none was
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Circuit breaker transition
#[derive(Debug, Clone, Serialize)]
pub struct BreakerEvent {
    pub state: BreakerState,
    pub kill_switch_active: bool,
    pub trigger_type: BreakerTrigger,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    decisions: broadcast::Sender<DecisionEvent>,
    breaker: broadcast::Sender<BreakerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (decisions, _) = broadcast::channel(capacity);
        let (breaker, _) = broadcast::channel(capacity);
        Self { decisions, breaker }
    }

    pub fn subscribe_decisions(&self) -> broadcast::Receiver<DecisionEvent> {
        self.decisions.subscribe()
    }

    pub fn subscribe_breaker(&self) -> broadcast::Receiver<BreakerEvent> {
        self.breaker.subscribe()
    }

    pub fn publish_decision(&self, event: DecisionEvent) {
        if self.decisions.send(event).is_err() {
            tracing::trace!("No decision subscribers");
        }
    }

    pub fn publish_breaker(&self, event: BreakerEvent) {
        if self.breaker.send(event).is_err() {
            tracing::trace!("No circuit breaker subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish_breaker(BreakerEvent {
            state: BreakerState::Tripped,
            kill_switch_active: false,
            trigger_type: BreakerTrigger::HardBudget,
            reason: "test".to_string(),
            timestamp: Utc::now(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_decision() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe_decisions();

        bus.publish_decision(DecisionEvent {
            ticker: "AAPL".to_string(),
            signal: Signal::Hold,
            consensus_score: 0.05,
            order: None,
            rejection: None,
            note: Some("below threshold".to_string()),
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.ticker, "AAPL");
        assert_eq!(event.signal, Signal::Hold);
    }
}
