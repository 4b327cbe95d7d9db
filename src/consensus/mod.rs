//! Weighted-vote arbitration of independent signal sources.
//!
//! Pure and deterministic: no clock reads, no randomness, no I/O. Identical
//! inputs always give an identical [`ConsensusResult`], which is what makes a
//! recorded decision replayable from its thought context.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::models::Signal;
use crate::signals::{SignalOutcome, SourceSignal};

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error, PartialEq)]
pub enum ConsensusError {
    #[error("weights must sum to 1.0, got {0}")]
    WeightSum(f64),

    #[error("weight for {source_id} must be finite and non-negative, got {weight}")]
    InvalidWeight { source_id: String, weight: f64 },

    #[error("sell threshold {sell} must not exceed buy threshold {buy}")]
    Thresholds { buy: f64, sell: f64 },
}

/// Per-source weights, validated to sum to 1.0
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Weights(BTreeMap<String, f64>);

impl Weights {
    pub fn new<I, S>(weights: I) -> Result<Self, ConsensusError>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let map: BTreeMap<String, f64> = weights
            .into_iter()
            .map(|(id, weight)| (id.into(), weight))
            .collect();

        for (source_id, &weight) in &map {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConsensusError::InvalidWeight {
                    source_id: source_id.clone(),
                    weight,
                });
            }
        }

        let sum: f64 = map.values().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConsensusError::WeightSum(sum));
        }

        Ok(Self(map))
    }

    pub fn get(&self, source_id: &str) -> Option<f64> {
        self.0.get(source_id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(id, w)| (id.as_str(), *w))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsensusConfig {
    /// Score strictly above this buys
    pub buy_threshold: f64,
    /// Score strictly below this sells
    pub sell_threshold: f64,
    /// The only source whose veto is honoured
    pub risk_source: String,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            buy_threshold: 0.3,
            sell_threshold: -0.3,
            risk_source: "risk".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContributionStatus {
    Voted,
    Abstained,
    Vetoed,
    /// Source answered but has no weight
    Unweighted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceContribution {
    pub source_id: String,
    pub vote: f64,
    pub confidence: f64,
    pub weight: f64,
    pub contribution: f64,
    pub status: ContributionStatus,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub ticker: String,
    pub signal: Signal,
    pub confidence: f64,
    pub consensus_score: f64,
    pub vetoed: bool,
    pub reasons: Vec<String>,
    /// Ordered by source id
    pub breakdown: Vec<SourceContribution>,
}

#[derive(Debug, Clone)]
pub struct ConsensusEngine {
    config: ConsensusConfig,
}

impl ConsensusEngine {
    pub fn new(config: ConsensusConfig) -> Result<Self, ConsensusError> {
        if config.sell_threshold > config.buy_threshold {
            return Err(ConsensusError::Thresholds {
                buy: config.buy_threshold,
                sell: config.sell_threshold,
            });
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Combine the cycle's signals into one directive.
    ///
    /// Weighted sources missing from `signals` count as abstentions. Only the
    /// configured risk source can veto; a veto elsewhere is an abstention.
    pub fn deliberate(
        &self,
        ticker: &str,
        signals: &[SourceSignal],
        weights: &Weights,
    ) -> ConsensusResult {
        let mut by_source: BTreeMap<&str, &SourceSignal> = BTreeMap::new();
        for signal in signals {
            by_source.entry(signal.source_id.as_str()).or_insert(signal);
        }

        let mut breakdown = Vec::new();
        let mut veto: Option<String> = None;

        let mut ids: Vec<&str> = weights.iter().map(|(id, _)| id).collect();
        ids.extend(by_source.keys().copied().filter(|id| weights.get(id).is_none()));
        ids.sort_unstable();

        for id in ids {
            let weight = weights.get(id);
            let signal = by_source.get(id);

            let mut entry = SourceContribution {
                source_id: id.to_string(),
                vote: 0.0,
                confidence: 0.0,
                weight: weight.unwrap_or(0.0),
                contribution: 0.0,
                status: ContributionStatus::Abstained,
                note: None,
            };

            match signal.map(|s| &s.outcome) {
                None => entry.note = Some("missing".to_string()),
                Some(SignalOutcome::Abstain { reason }) => entry.note = Some(reason.clone()),
                Some(SignalOutcome::Veto { reason }) if id == self.config.risk_source => {
                    entry.status = ContributionStatus::Vetoed;
                    entry.note = Some(reason.clone());
                    veto = Some(reason.clone());
                }
                Some(SignalOutcome::Veto { reason }) => {
                    entry.note = Some(format!("veto ignored from non-risk source: {}", reason));
                }
                Some(SignalOutcome::Vote { vote, confidence })
                    if !vote.is_finite() || !confidence.is_finite() =>
                {
                    entry.note = Some("non-finite vote or confidence".to_string());
                }
                Some(SignalOutcome::Vote { vote, confidence }) => {
                    entry.vote = vote.clamp(-1.0, 1.0);
                    entry.confidence = confidence.clamp(0.0, 1.0);
                    match weight {
                        Some(w) => {
                            entry.status = ContributionStatus::Voted;
                            entry.contribution = entry.vote * entry.confidence * w;
                        }
                        None => entry.status = ContributionStatus::Unweighted,
                    }
                }
            }

            breakdown.push(entry);
        }

        if let Some(reason) = veto {
            return ConsensusResult {
                ticker: ticker.to_string(),
                signal: Signal::Hold,
                confidence: 1.0,
                consensus_score: 0.0,
                vetoed: true,
                reasons: vec![
                    "VETO".to_string(),
                    format!("{}: {}", self.config.risk_source, reason),
                ],
                breakdown,
            };
        }

        let consensus_score = breakdown
            .iter()
            .map(|c| c.contribution)
            .sum::<f64>()
            .clamp(-1.0, 1.0);

        let signal = if consensus_score > self.config.buy_threshold {
            Signal::Buy
        } else if consensus_score < self.config.sell_threshold {
            Signal::Sell
        } else {
            Signal::Hold
        };

        let mut reasons = vec![format!(
            "score {:+.4} vs thresholds ({:+.2}, {:+.2})",
            consensus_score, self.config.sell_threshold, self.config.buy_threshold
        )];
        reasons.extend(breakdown.iter().map(|c| match c.status {
            ContributionStatus::Voted => format!(
                "{}: {:+.2}@{:.2} x {:.2} = {:+.4}",
                c.source_id, c.vote, c.confidence, c.weight, c.contribution
            ),
            _ => format!(
                "{}: {:?}{}",
                c.source_id,
                c.status,
                c.note
                    .as_deref()
                    .map(|n| format!(" ({})", n))
                    .unwrap_or_default()
            ),
        }));

        ConsensusResult {
            ticker: ticker.to_string(),
            signal,
            confidence: consensus_score.abs().min(1.0),
            consensus_score,
            vetoed: false,
            reasons,
            breakdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn vote(id: &str, vote: f64, confidence: f64) -> SourceSignal {
        SourceSignal {
            source_id: id.to_string(),
            outcome: SignalOutcome::Vote { vote, confidence },
            reasons: Vec::new(),
        }
    }

    fn veto(id: &str, reason: &str) -> SourceSignal {
        SourceSignal {
            source_id: id.to_string(),
            outcome: SignalOutcome::Veto {
                reason: reason.to_string(),
            },
            reasons: Vec::new(),
        }
    }

    fn standard_weights() -> Weights {
        Weights::new([("tech", 0.4), ("news", 0.3), ("vision", 0.2), ("risk", 0.1)]).unwrap()
    }

    fn engine() -> ConsensusEngine {
        ConsensusEngine::new(ConsensusConfig::default()).unwrap()
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        assert!(matches!(
            Weights::new([("a", 0.5), ("b", 0.4)]),
            Err(ConsensusError::WeightSum(_))
        ));
        assert!(matches!(
            Weights::new([("a", 1.5), ("b", -0.5)]),
            Err(ConsensusError::InvalidWeight { .. })
        ));
        assert!(Weights::new([("a", 0.1), ("b", 0.2), ("c", 0.7)]).is_ok());
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let config = ConsensusConfig {
            buy_threshold: -0.2,
            sell_threshold: 0.2,
            ..Default::default()
        };
        assert!(ConsensusEngine::new(config).is_err());
    }

    #[test]
    fn test_weighted_example_buys() {
        let signals = vec![
            vote("tech", 1.0, 0.8),
            vote("news", 0.0, 0.0),
            vote("vision", 0.0, 0.0),
            vote("risk", 0.2, 1.0),
        ];

        let result = engine().deliberate("AAPL", &signals, &standard_weights());

        assert!((result.consensus_score - 0.34).abs() < 1e-9);
        assert_eq!(result.signal, Signal::Buy);
        assert!((result.confidence - 0.34).abs() < 1e-9);
        assert!(!result.vetoed);
    }

    #[test]
    fn test_veto_overrides_everything() {
        let signals = vec![
            vote("tech", 1.0, 1.0),
            vote("news", 1.0, 1.0),
            vote("vision", 1.0, 1.0),
            veto("risk", "position limit"),
        ];

        let result = engine().deliberate("AAPL", &signals, &standard_weights());

        assert_eq!(result.signal, Signal::Hold);
        assert_eq!(result.confidence, 1.0);
        assert!(result.vetoed);
        assert_eq!(result.reasons[0], "VETO");
    }

    #[test]
    fn test_veto_from_non_risk_source_is_ignored() {
        let signals = vec![vote("tech", 1.0, 1.0), veto("news", "rumour")];

        let result = engine().deliberate("AAPL", &signals, &standard_weights());

        assert!(!result.vetoed);
        assert_eq!(result.signal, Signal::Buy);
        let news = result
            .breakdown
            .iter()
            .find(|c| c.source_id == "news")
            .unwrap();
        assert_eq!(news.status, ContributionStatus::Abstained);
    }

    #[test]
    fn test_missing_sources_abstain() {
        let signals = vec![vote("tech", -1.0, 1.0)];

        let result = engine().deliberate("AAPL", &signals, &standard_weights());

        assert!((result.consensus_score + 0.4).abs() < 1e-9);
        assert_eq!(result.signal, Signal::Sell);
        let missing = result
            .breakdown
            .iter()
            .filter(|c| c.note.as_deref() == Some("missing"))
            .count();
        assert_eq!(missing, 3);
    }

    #[test]
    fn test_non_finite_vote_abstains() {
        let signals = vec![
            vote("tech", f64::NAN, 1.0),
            vote("news", 1.0, f64::INFINITY),
            vote("vision", 1.0, 1.0),
        ];

        let result = engine().deliberate("AAPL", &signals, &standard_weights());

        assert!((result.consensus_score - 0.2).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&result.confidence));
        assert_eq!(result.signal, Signal::Hold);
        let tech = result.breakdown.iter().find(|c| c.source_id == "tech").unwrap();
        assert_eq!(tech.status, ContributionStatus::Abstained);
        assert_eq!(tech.contribution, 0.0);
    }

    #[test]
    fn test_no_signals_holds() {
        let result = engine().deliberate("AAPL", &[], &standard_weights());

        assert_eq!(result.signal, Signal::Hold);
        assert_eq!(result.consensus_score, 0.0);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_unweighted_source_does_not_contribute() {
        let signals = vec![vote("tech", 0.5, 1.0), vote("astrology", 1.0, 1.0)];

        let result = engine().deliberate("AAPL", &signals, &standard_weights());

        assert!((result.consensus_score - 0.2).abs() < 1e-9);
        let extra = result
            .breakdown
            .iter()
            .find(|c| c.source_id == "astrology")
            .unwrap();
        assert_eq!(extra.status, ContributionStatus::Unweighted);
    }

    #[test]
    fn test_deliberate_is_deterministic() {
        let signals = vec![
            vote("vision", 0.3, 0.6),
            vote("tech", 0.9, 0.7),
            vote("news", -0.4, 0.5),
        ];
        let mut shuffled = signals.clone();
        shuffled.reverse();

        let a = engine().deliberate("AAPL", &signals, &standard_weights());
        let b = engine().deliberate("AAPL", &shuffled, &standard_weights());

        assert_eq!(a, b);
    }

    #[test]
    fn test_score_bounded_for_random_inputs() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..2_000 {
            let raw: Vec<f64> = (0..4).map(|_| rng.gen_range(0.0..1.0)).collect();
            let total: f64 = raw.iter().sum::<f64>().max(f64::EPSILON);
            let ids = ["tech", "news", "vision", "risk"];
            let weights = Weights::new(
                ids.iter()
                    .zip(&raw)
                    .map(|(id, w)| (id.to_string(), w / total)),
            );
            let Ok(weights) = weights else { continue };

            let signals: Vec<SourceSignal> = ids
                .iter()
                .map(|id| vote(id, rng.gen_range(-1.0..=1.0), rng.gen_range(0.0..=1.0)))
                .collect();

            let result = engine().deliberate("X", &signals, &weights);

            assert!((-1.0..=1.0).contains(&result.consensus_score));
            assert!((0.0..=1.0).contains(&result.confidence));
        }
    }
}
