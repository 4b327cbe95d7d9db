// Signal sources and the bounded-wait aggregator in front of consensus
pub mod aggregator;
pub mod http;

pub use aggregator::SignalAggregator;
pub use http::HttpSignalSource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One source's opinion for one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalOutcome {
    Vote { vote: f64, confidence: f64 },
    Veto { reason: String },
    Abstain { reason: String },
}

impl SignalOutcome {
    pub fn abstain(reason: impl Into<String>) -> Self {
        SignalOutcome::Abstain {
            reason: reason.into(),
        }
    }

    /// Vote with both values clamped to their ranges
    pub fn vote(vote: f64, confidence: f64) -> Self {
        SignalOutcome::Vote {
            vote: vote.clamp(-1.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// A tagged outcome attributed to its source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSignal {
    pub source_id: String,
    pub outcome: SignalOutcome,
    pub reasons: Vec<String>,
}

/// Wire shape returned by a signal source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalReport {
    pub vote: f64,
    pub confidence: f64,
    #[serde(default)]
    pub is_veto: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl SignalReport {
    pub fn into_outcome(self) -> (SignalOutcome, Vec<String>) {
        if self.is_veto {
            let reason = if self.reasons.is_empty() {
                "veto".to_string()
            } else {
                self.reasons.join("; ")
            };
            return (SignalOutcome::Veto { reason }, self.reasons);
        }

        if !self.vote.is_finite() || !self.confidence.is_finite() {
            return (
                SignalOutcome::abstain("non-finite vote or confidence"),
                self.reasons,
            );
        }

        (SignalOutcome::vote(self.vote, self.confidence), self.reasons)
    }
}

/// An independent producer of opinions about a ticker
#[async_trait]
pub trait SignalSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn get_signal(&self, ticker: &str) -> anyhow::Result<SignalReport>;
}

/// Source that always answers with the same report. Used for dry runs and tests.
#[derive(Debug, Clone)]
pub struct StaticSignalSource {
    id: String,
    report: SignalReport,
}

impl StaticSignalSource {
    pub fn new(id: impl Into<String>, report: SignalReport) -> Self {
        Self {
            id: id.into(),
            report,
        }
    }

    pub fn voting(id: impl Into<String>, vote: f64, confidence: f64) -> Self {
        Self::new(
            id,
            SignalReport {
                vote,
                confidence,
                is_veto: false,
                reasons: Vec::new(),
            },
        )
    }

    pub fn vetoing(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            id,
            SignalReport {
                vote: 0.0,
                confidence: 1.0,
                is_veto: true,
                reasons: vec![reason.into()],
            },
        )
    }
}

#[async_trait]
impl SignalSource for StaticSignalSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn get_signal(&self, _ticker: &str) -> anyhow::Result<SignalReport> {
        Ok(self.report.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_veto_wins_over_vote() {
        let report = SignalReport {
            vote: 1.0,
            confidence: 1.0,
            is_veto: true,
            reasons: vec!["earnings tomorrow".to_string()],
        };

        let (outcome, _) = report.into_outcome();
        assert_eq!(
            outcome,
            SignalOutcome::Veto {
                reason: "earnings tomorrow".to_string()
            }
        );
    }

    #[test]
    fn test_report_clamps_out_of_range_values() {
        let report = SignalReport {
            vote: 3.0,
            confidence: -0.5,
            is_veto: false,
            reasons: Vec::new(),
        };

        let (outcome, _) = report.into_outcome();
        assert_eq!(
            outcome,
            SignalOutcome::Vote {
                vote: 1.0,
                confidence: 0.0
            }
        );
    }

    #[test]
    fn test_report_nan_abstains() {
        let report = SignalReport {
            vote: f64::NAN,
            confidence: 0.5,
            is_veto: false,
            reasons: Vec::new(),
        };

        let (outcome, _) = report.into_outcome();
        assert!(matches!(outcome, SignalOutcome::Abstain { .. }));
    }

    #[test]
    fn test_report_deserializes_with_defaults() {
        let report: SignalReport =
            serde_json::from_str(r#"{"vote": 0.5, "confidence": 0.9}"#).unwrap();

        assert!(!report.is_veto);
        assert!(report.reasons.is_empty());
    }
}
