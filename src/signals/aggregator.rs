use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Duration, Instant};

use super::{SignalOutcome, SignalSource, SourceSignal};

/// Extra time the join waits beyond the per-source timeout
const JOIN_GRACE: Duration = Duration::from_millis(250);

/// Fans a ticker out to every source and waits a bounded time for the answers.
///
/// Each source runs as its own task under `source_timeout`. Failures, timeouts
/// and panics become abstentions; the cycle never aborts because of a source.
/// Tasks still running when `collect` returns are aborted.
pub struct SignalAggregator {
    sources: Vec<Arc<dyn SignalSource>>,
    source_timeout: Duration,
}

impl SignalAggregator {
    pub fn new(sources: Vec<Arc<dyn SignalSource>>, source_timeout: Duration) -> Self {
        Self {
            sources,
            source_timeout,
        }
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources
            .iter()
            .map(|s| s.source_id().to_string())
            .collect()
    }

    /// One signal per source, in source registration order
    pub async fn collect(&self, ticker: &str) -> Vec<SourceSignal> {
        let mut tasks = JoinSet::new();

        for (index, source) in self.sources.iter().enumerate() {
            let source = source.clone();
            let ticker = ticker.to_string();
            let source_timeout = self.source_timeout;

            tasks.spawn(async move {
                let outcome = match timeout(source_timeout, source.get_signal(&ticker)).await {
                    Ok(Ok(report)) => report.into_outcome(),
                    Ok(Err(e)) => {
                        tracing::warn!(
                            "Signal source {} failed for {}: {:#}",
                            source.source_id(),
                            ticker,
                            e
                        );
                        (SignalOutcome::abstain(format!("error: {}", e)), Vec::new())
                    }
                    Err(_) => {
                        tracing::warn!(
                            "Signal source {} timed out for {} after {:?}",
                            source.source_id(),
                            ticker,
                            source_timeout
                        );
                        (SignalOutcome::abstain("timeout"), Vec::new())
                    }
                };
                (index, outcome)
            });
        }

        let mut results: Vec<Option<(SignalOutcome, Vec<String>)>> =
            vec![None; self.sources.len()];
        let deadline = Instant::now() + self.source_timeout + JOIN_GRACE;

        loop {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((index, outcome)))) => results[index] = Some(outcome),
                Ok(Some(Err(e))) => {
                    tracing::warn!("Signal task for {} did not complete: {}", ticker, e);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("Signal aggregation for {} hit its deadline", ticker);
                    break;
                }
            }
        }
        tasks.abort_all();

        self.sources
            .iter()
            .zip(results)
            .map(|(source, result)| {
                let (outcome, reasons) = result.unwrap_or_else(|| {
                    (SignalOutcome::abstain("no response"), Vec::new())
                });
                tracing::debug!("{} {} -> {:?}", ticker, source.source_id(), outcome);
                SourceSignal {
                    source_id: source.source_id().to_string(),
                    outcome,
                    reasons,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{SignalReport, StaticSignalSource};
    use async_trait::async_trait;

    struct SlowSource;

    #[async_trait]
    impl SignalSource for SlowSource {
        fn source_id(&self) -> &str {
            "slow"
        }

        async fn get_signal(&self, _ticker: &str) -> anyhow::Result<SignalReport> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            anyhow::bail!("should have been cancelled")
        }
    }

    struct FailingSource;

    #[async_trait]
    impl SignalSource for FailingSource {
        fn source_id(&self) -> &str {
            "failing"
        }

        async fn get_signal(&self, _ticker: &str) -> anyhow::Result<SignalReport> {
            anyhow::bail!("model server down")
        }
    }

    struct PanickingSource;

    #[async_trait]
    impl SignalSource for PanickingSource {
        fn source_id(&self) -> &str {
            "panicking"
        }

        async fn get_signal(&self, _ticker: &str) -> anyhow::Result<SignalReport> {
            panic!("bug in source")
        }
    }

    #[tokio::test]
    async fn test_collect_preserves_source_order() {
        let aggregator = SignalAggregator::new(
            vec![
                Arc::new(StaticSignalSource::voting("tech", 1.0, 0.8)),
                Arc::new(StaticSignalSource::voting("news", -0.5, 0.4)),
            ],
            Duration::from_millis(200),
        );

        let signals = aggregator.collect("AAPL").await;

        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].source_id, "tech");
        assert_eq!(
            signals[1].outcome,
            SignalOutcome::Vote {
                vote: -0.5,
                confidence: 0.4
            }
        );
    }

    #[tokio::test]
    async fn test_slow_source_abstains_without_blocking() {
        let aggregator = SignalAggregator::new(
            vec![
                Arc::new(SlowSource),
                Arc::new(StaticSignalSource::voting("tech", 1.0, 1.0)),
            ],
            Duration::from_millis(50),
        );

        let started = std::time::Instant::now();
        let signals = aggregator.collect("AAPL").await;

        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(signals[0].outcome, SignalOutcome::abstain("timeout"));
        assert!(matches!(signals[1].outcome, SignalOutcome::Vote { .. }));
    }

    #[tokio::test]
    async fn test_failing_and_panicking_sources_abstain() {
        let aggregator = SignalAggregator::new(
            vec![Arc::new(FailingSource), Arc::new(PanickingSource)],
            Duration::from_millis(100),
        );

        let signals = aggregator.collect("AAPL").await;

        match &signals[0].outcome {
            SignalOutcome::Abstain { reason } => assert!(reason.contains("model server down")),
            other => panic!("expected abstain, got {:?}", other),
        }
        assert_eq!(signals[1].outcome, SignalOutcome::abstain("no response"));
    }

    #[tokio::test]
    async fn test_veto_passes_through() {
        let aggregator = SignalAggregator::new(
            vec![Arc::new(StaticSignalSource::vetoing("risk", "halted"))],
            Duration::from_millis(100),
        );

        let signals = aggregator.collect("AAPL").await;

        assert_eq!(
            signals[0].outcome,
            SignalOutcome::Veto {
                reason: "halted".to_string()
            }
        );
        assert_eq!(signals[0].reasons, vec!["halted".to_string()]);
    }
}
