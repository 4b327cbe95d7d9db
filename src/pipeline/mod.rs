//! One decision cycle per ticker: collect signals, deliberate, size the
//! order, hand it to the ledger and publish what happened.

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::consensus::{ConsensusEngine, ConsensusResult, Weights};
use crate::events::{DecisionEvent, EventBus};
use crate::ledger::{LedgerError, TradeLedger, TradeOutcome};
use crate::models::{Signal, TradeAction, TradeRequest};
use crate::signals::SignalAggregator;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Fraction of current equity spent on one buy (0.05 = 5%)
    pub position_size_pct: f64,
    /// Floor buy quantities to whole units
    pub whole_units: bool,
    pub strategy_tag: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            position_size_pct: 0.05,
            whole_units: true,
            strategy_tag: "consensus".to_string(),
        }
    }
}

/// Result of one cycle. `outcome` is `None` when no order was attempted.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub consensus: ConsensusResult,
    pub outcome: Option<TradeOutcome>,
    pub note: Option<String>,
}

pub struct DecisionPipeline {
    aggregator: SignalAggregator,
    engine: ConsensusEngine,
    weights: Weights,
    ledger: Arc<TradeLedger>,
    events: EventBus,
    config: PipelineConfig,
}

impl DecisionPipeline {
    pub fn new(
        aggregator: SignalAggregator,
        engine: ConsensusEngine,
        weights: Weights,
        ledger: Arc<TradeLedger>,
        events: EventBus,
        config: PipelineConfig,
    ) -> anyhow::Result<Self> {
        if !config.position_size_pct.is_finite()
            || config.position_size_pct <= 0.0
            || config.position_size_pct > 1.0
        {
            anyhow::bail!(
                "position_size_pct must be in (0, 1], got {}",
                config.position_size_pct
            );
        }

        for id in aggregator.source_ids() {
            if weights.get(&id).is_none() {
                tracing::warn!("Signal source {} has no consensus weight and will not count", id);
            }
        }

        Ok(Self {
            aggregator,
            engine,
            weights,
            ledger,
            events,
            config,
        })
    }

    pub fn ledger(&self) -> &Arc<TradeLedger> {
        &self.ledger
    }

    /// Run one decision cycle for `ticker`.
    ///
    /// Only a ledger write failure is an error; everything else, including a
    /// rejected order, is reported in the [`CycleReport`] and published.
    pub async fn run_cycle(&self, ticker: &str) -> Result<CycleReport, LedgerError> {
        let signals = self.aggregator.collect(ticker).await;
        let consensus = self.engine.deliberate(ticker, &signals, &self.weights);

        tracing::info!(
            "🧠 {} consensus {:.3} → {} (confidence {:.2})",
            ticker,
            consensus.consensus_score,
            consensus.signal,
            consensus.confidence
        );

        let (request, note) = match self.size_order(&consensus).await {
            Ok(request) => (Some(request), None),
            Err(note) => {
                tracing::info!("⏸️  {}: no order, {}", ticker, note);
                (None, Some(note))
            }
        };

        let outcome = match request {
            Some(request) => match self.ledger.execute_trade(request).await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    self.publish(&consensus, None, Some(format!("ledger write failed: {}", e)));
                    return Err(e);
                }
            },
            None => None,
        };

        self.publish(&consensus, outcome.as_ref(), note.clone());

        Ok(CycleReport {
            consensus,
            outcome,
            note,
        })
    }

    /// Cycles for several tickers, run concurrently. Ledger writes still
    /// serialize inside the ledger.
    pub async fn run_all(
        &self,
        tickers: &[String],
    ) -> Vec<(String, Result<CycleReport, LedgerError>)> {
        join_all(tickers.iter().map(|ticker| async move {
            (ticker.clone(), self.run_cycle(ticker).await)
        }))
        .await
    }

    /// Turn a directive into a request, or say why there is none
    async fn size_order(&self, consensus: &ConsensusResult) -> Result<TradeRequest, String> {
        let ticker = consensus.ticker.as_str();

        let action = match consensus.signal {
            Signal::Hold if consensus.vetoed => {
                return Err(format!("vetoed: {}", consensus.reasons.join("; ")))
            }
            Signal::Hold => return Err("score within thresholds".to_string()),
            Signal::Buy => TradeAction::Buy,
            Signal::Sell => TradeAction::Sell,
        };

        let held = self.ledger.get_position(ticker).map(|p| p.quantity);
        if action == TradeAction::Sell && held.is_none() {
            return Err("sell signal without a position".to_string());
        }

        let price = self
            .ledger
            .prices()
            .quote(ticker)
            .await
            .ok_or_else(|| format!("no price available for {}", ticker))?;

        let quantity = match action {
            // Long-only: a sell closes the whole position
            TradeAction::Sell => held.unwrap_or_default(),
            TradeAction::Buy => {
                let equity = self.ledger.get_current_balance().total_equity;
                let budget = equity * self.config.position_size_pct;
                let raw = budget / price;
                let quantity = if self.config.whole_units { raw.floor() } else { raw };
                if quantity <= 0.0 {
                    return Err(format!(
                        "${:.2} budget buys less than one unit at ${:.2}",
                        budget, price
                    ));
                }
                quantity
            }
        };

        Ok(TradeRequest::new(ticker, action, quantity, price)
            .with_strategy(self.config.strategy_tag.clone())
            .with_reason(consensus.reasons.join("; "))
            .with_thought_context(serde_json::to_value(consensus).unwrap_or_default()))
    }

    fn publish(&self, consensus: &ConsensusResult, outcome: Option<&TradeOutcome>, note: Option<String>) {
        self.events.publish_decision(DecisionEvent {
            ticker: consensus.ticker.clone(),
            signal: consensus.signal,
            consensus_score: consensus.consensus_score,
            order: outcome.and_then(TradeOutcome::order).cloned(),
            rejection: outcome.and_then(TradeOutcome::rejection).cloned(),
            note,
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ConsensusConfig;
    use crate::db::MemoryStore;
    use crate::ledger::LedgerConfig;
    use crate::market::PriceBook;
    use crate::risk::{CircuitBreaker, CircuitBreakerConfig};
    use crate::signals::{SignalSource, StaticSignalSource};
    use tokio::time::Duration;

    async fn pipeline(sources: Vec<Arc<dyn SignalSource>>) -> (DecisionPipeline, EventBus) {
        let store = Arc::new(MemoryStore::new());
        let events = EventBus::default();
        let breaker = Arc::new(
            CircuitBreaker::load(
                "paper",
                store.clone(),
                events.clone(),
                CircuitBreakerConfig::default(),
            )
            .await
            .unwrap(),
        );
        let prices = Arc::new(PriceBook::offline());
        prices.record("AAPL", 100.0);

        let ledger = Arc::new(
            TradeLedger::open(
                LedgerConfig {
                    account_id: "paper".to_string(),
                    initial_cash: 100_000.0,
                    commission_rate: 0.001,
                },
                store,
                breaker,
                prices,
            )
            .await
            .unwrap(),
        );

        let weights = Weights::new([("tech", 0.4), ("news", 0.3), ("vision", 0.2), ("risk", 0.1)])
            .unwrap();
        let pipeline = DecisionPipeline::new(
            SignalAggregator::new(sources, Duration::from_millis(200)),
            ConsensusEngine::new(ConsensusConfig::default()).unwrap(),
            weights,
            ledger,
            events.clone(),
            PipelineConfig::default(),
        )
        .unwrap();

        (pipeline, events)
    }

    fn bullish() -> Vec<Arc<dyn SignalSource>> {
        vec![
            Arc::new(StaticSignalSource::voting("tech", 1.0, 0.8)),
            Arc::new(StaticSignalSource::voting("news", 0.0, 0.0)),
            Arc::new(StaticSignalSource::voting("vision", 0.0, 0.0)),
            Arc::new(StaticSignalSource::voting("risk", 0.2, 1.0)),
        ]
    }

    #[tokio::test]
    async fn test_buy_cycle_sizes_by_equity() {
        let (pipeline, events) = pipeline(bullish()).await;
        let mut decisions = events.subscribe_decisions();

        let report = pipeline.run_cycle("AAPL").await.unwrap();

        assert_eq!(report.consensus.signal, Signal::Buy);
        let order = report.outcome.as_ref().and_then(TradeOutcome::order).unwrap();
        // 5% of 100k at $100
        assert_eq!(order.quantity, 50.0);
        assert_eq!(order.strategy_tag, "consensus");
        assert_eq!(
            order.thought_context["consensus_score"].as_f64().unwrap(),
            report.consensus.consensus_score
        );

        let event = decisions.recv().await.unwrap();
        assert_eq!(event.ticker, "AAPL");
        assert_eq!(event.order.unwrap().id, order.id);
        assert!(event.rejection.is_none());
    }

    #[tokio::test]
    async fn test_veto_publishes_without_order() {
        let sources: Vec<Arc<dyn SignalSource>> = vec![
            Arc::new(StaticSignalSource::voting("tech", 1.0, 1.0)),
            Arc::new(StaticSignalSource::vetoing("risk", "earnings tomorrow")),
        ];
        let (pipeline, events) = pipeline(sources).await;
        let mut decisions = events.subscribe_decisions();

        let report = pipeline.run_cycle("AAPL").await.unwrap();

        assert!(report.outcome.is_none());
        assert!(report.note.unwrap().starts_with("vetoed"));
        assert!(pipeline.ledger().get_trade_history(None).is_empty());

        let event = decisions.recv().await.unwrap();
        assert_eq!(event.signal, Signal::Hold);
        assert!(event.order.is_none());
    }

    #[tokio::test]
    async fn test_sell_signal_without_position_is_a_no_op() {
        let sources: Vec<Arc<dyn SignalSource>> =
            vec![Arc::new(StaticSignalSource::voting("tech", -1.0, 1.0))];
        let (pipeline, _) = pipeline(sources).await;

        let report = pipeline.run_cycle("AAPL").await.unwrap();

        assert_eq!(report.consensus.signal, Signal::Sell);
        assert!(report.outcome.is_none());
    }

    #[tokio::test]
    async fn test_sell_signal_closes_position() {
        let sources: Vec<Arc<dyn SignalSource>> =
            vec![Arc::new(StaticSignalSource::voting("tech", -1.0, 1.0))];
        let (pipeline, _) = pipeline(sources).await;
        pipeline
            .ledger()
            .execute_trade(TradeRequest::buy("AAPL", 7.0, 100.0))
            .await
            .unwrap();

        let report = pipeline.run_cycle("AAPL").await.unwrap();

        let order = report.outcome.as_ref().and_then(TradeOutcome::order).unwrap();
        assert_eq!(order.action, TradeAction::Sell);
        assert_eq!(order.quantity, 7.0);
        assert!(pipeline.ledger().get_position("AAPL").is_none());
    }

    #[tokio::test]
    async fn test_missing_price_skips_order() {
        let (pipeline, _) = pipeline(bullish()).await;

        let report = pipeline.run_cycle("UNQUOTED").await.unwrap();

        assert_eq!(report.consensus.signal, Signal::Buy);
        assert!(report.outcome.is_none());
        assert!(report.note.unwrap().contains("no price"));
    }

    #[tokio::test]
    async fn test_tripped_breaker_surfaces_as_rejection() {
        let (pipeline, events) = pipeline(bullish()).await;
        pipeline
            .ledger()
            .breaker()
            .activate_kill_switch("halt")
            .await
            .unwrap();
        let mut decisions = events.subscribe_decisions();

        let report = pipeline.run_cycle("AAPL").await.unwrap();

        let rejection = report.outcome.as_ref().and_then(TradeOutcome::rejection).unwrap();
        assert_eq!(rejection.code(), "CIRCUIT_OPEN");
        assert_eq!(decisions.recv().await.unwrap().rejection.unwrap().code(), "CIRCUIT_OPEN");
    }

    #[tokio::test]
    async fn test_run_all_covers_every_ticker() {
        let (pipeline, _) = pipeline(bullish()).await;
        pipeline.ledger().prices().record("MSFT", 400.0);

        let tickers = vec!["AAPL".to_string(), "MSFT".to_string()];
        let results = pipeline.run_all(&tickers).await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.as_ref().unwrap().outcome.is_some()));
        assert_eq!(pipeline.ledger().get_positions().len(), 2);
    }
}
