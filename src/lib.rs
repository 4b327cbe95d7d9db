// Core modules
pub mod config;
pub mod consensus;
pub mod db;
pub mod events;
pub mod ledger;
pub mod market;
pub mod models;
pub mod persistence;
pub mod pipeline;
pub mod risk;
pub mod signals;

// Re-export commonly used types
pub use consensus::{ConsensusConfig, ConsensusEngine, ConsensusResult, Weights};
pub use events::{BreakerEvent, DecisionEvent, EventBus};
pub use ledger::{LedgerConfig, LedgerError, Rejection, TradeLedger, TradeOutcome};
pub use models::*;
pub use pipeline::{CycleReport, DecisionPipeline, PipelineConfig};
pub use risk::{CircuitBreaker, CircuitBreakerConfig};

// Error handling
pub type Result<T> = anyhow::Result<T>;
