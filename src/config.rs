//! Settings from an optional `tradegate.toml`, overridden by
//! `TRADEGATE__SECTION__KEY` environment variables.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tokio::time::Duration;

use crate::consensus::{ConsensusConfig, ConsensusError, Weights};
use crate::ledger::LedgerConfig;
use crate::pipeline::PipelineConfig;
use crate::risk::CircuitBreakerConfig;

const DEFAULT_FILE: &str = "tradegate";
const ENV_PREFIX: &str = "TRADEGATE";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub account: AccountSettings,
    #[serde(default)]
    pub consensus: ConsensusSettings,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub market_data_url: Option<String>,
    #[serde(default)]
    pub signal_sources: Vec<SignalSourceSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountSettings {
    pub id: String,
    pub initial_cash: f64,
    pub commission_rate: f64,
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            id: "paper".to_string(),
            initial_cash: 100_000.0,
            commission_rate: 0.001, // 0.1% per side
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSettings {
    pub weights: BTreeMap<String, f64>,
    pub buy_threshold: f64,
    pub sell_threshold: f64,
    pub risk_source: String,
    pub source_timeout_ms: u64,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        let engine = ConsensusConfig::default();
        Self {
            weights: BTreeMap::from([
                ("tech".to_string(), 0.4),
                ("news".to_string(), 0.3),
                ("vision".to_string(), 0.2),
                ("risk".to_string(), 0.1),
            ]),
            buy_threshold: engine.buy_threshold,
            sell_threshold: engine.sell_threshold,
            risk_source: engine.risk_source,
            source_timeout_ms: 5_000,
        }
    }
}

impl ConsensusSettings {
    pub fn engine_config(&self) -> ConsensusConfig {
        ConsensusConfig {
            buy_threshold: self.buy_threshold,
            sell_threshold: self.sell_threshold,
            risk_source: self.risk_source.clone(),
        }
    }

    pub fn weights(&self) -> Result<Weights, ConsensusError> {
        Weights::new(self.weights.iter().map(|(id, w)| (id.clone(), *w)))
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub tickers: Vec<String>,
    pub position_size_pct: f64,
    pub whole_units: bool,
    pub strategy_tag: String,
    /// Seconds between cycles in `run` mode
    pub interval_secs: u64,
    pub quote_timeout_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let sizing = PipelineConfig::default();
        Self {
            tickers: Vec::new(),
            position_size_pct: sizing.position_size_pct,
            whole_units: sizing.whole_units,
            strategy_tag: sizing.strategy_tag,
            interval_secs: 300,
            quote_timeout_ms: 2_000,
        }
    }
}

impl PipelineSettings {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            position_size_pct: self.position_size_pct,
            whole_units: self.whole_units,
            strategy_tag: self.strategy_tag.clone(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn quote_timeout(&self) -> Duration {
        Duration::from_millis(self.quote_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSourceSettings {
    pub id: String,
    pub base_url: String,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

fn default_requests_per_minute() -> u32 {
    60
}

impl Settings {
    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            account_id: self.account.id.clone(),
            initial_cash: self.account.initial_cash,
            commission_rate: self.account.commission_rate,
        }
    }

    /// Cross-field checks that no single component can make
    pub fn validate(&self) -> anyhow::Result<()> {
        self.consensus.weights()?;
        self.circuit_breaker.validate()?;

        let mut seen = HashSet::new();
        for source in &self.signal_sources {
            if !seen.insert(source.id.as_str()) {
                anyhow::bail!("signal source {} is configured twice", source.id);
            }
        }

        Ok(())
    }
}

/// Load settings.
///
/// With `path`, that file must exist. Without, `tradegate.toml` in the
/// working directory is used if present. `DATABASE_URL` and `REDIS_URL` fill
/// in when the settings leave them unset.
pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let env = Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("pipeline.tickers");

    let mut settings = build(path, env)?;

    if settings.database_url.is_none() {
        settings.database_url = std::env::var("DATABASE_URL").ok();
    }
    if settings.redis_url.is_none() {
        settings.redis_url = std::env::var("REDIS_URL").ok();
    }

    Ok(settings)
}

fn build(path: Option<&Path>, env: Environment) -> Result<Settings, ConfigError> {
    let file = match path {
        Some(path) => File::from(path).required(true),
        None => File::with_name(DEFAULT_FILE).required(false),
    };

    Config::builder()
        .add_source(file)
        .add_source(env)
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn empty_env() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .source(Some(config::Map::new()))
    }

    fn write_config(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("tradegate-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_file() {
        let missing = std::env::temp_dir().join("tradegate-does-not-exist");
        let settings = build(None, empty_env()).unwrap();

        assert_eq!(settings.account.id, "paper");
        assert_eq!(settings.consensus.weights.len(), 4);
        assert!(settings.validate().is_ok());
        assert!(build(Some(&missing), empty_env()).is_err());
    }

    #[test]
    fn test_file_values() {
        let path = write_config(
            r#"
            database_url = "postgres://localhost/tradegate"

            [account]
            id = "live-1"
            initial_cash = 25000.0

            [consensus.weights]
            tech = 0.5
            risk = 0.5

            [circuit_breaker]
            hard_budget_limit = 750.0

            [pipeline]
            tickers = ["AAPL", "MSFT"]

            [[signal_sources]]
            id = "tech"
            base_url = "http://localhost:9001"
            "#,
        );

        let settings = build(Some(&path), empty_env()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.account.id, "live-1");
        assert_eq!(settings.account.commission_rate, 0.001);
        assert_eq!(settings.circuit_breaker.hard_budget_limit, 750.0);
        assert_eq!(settings.circuit_breaker.daily_loss_limit, 1_000.0);
        assert_eq!(settings.pipeline.tickers, vec!["AAPL", "MSFT"]);
        assert_eq!(settings.signal_sources[0].requests_per_minute, 60);
        assert_eq!(settings.consensus.weights().unwrap().get("tech"), Some(0.5));
    }

    #[test]
    fn test_environment_overrides_file() {
        let path = write_config("[account]\nid = \"from-file\"\n");
        let env = Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("pipeline.tickers")
            .source(Some(config::Map::from([
                ("TRADEGATE__ACCOUNT__ID".to_string(), "from-env".to_string()),
                ("TRADEGATE__ACCOUNT__INITIAL_CASH".to_string(), "5000".to_string()),
                ("TRADEGATE__PIPELINE__TICKERS".to_string(), "NVDA,AMD".to_string()),
            ])));

        let settings = build(Some(&path), env).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.account.id, "from-env");
        assert_eq!(settings.account.initial_cash, 5_000.0);
        assert_eq!(settings.pipeline.tickers, vec!["NVDA", "AMD"]);
    }

    #[test]
    fn test_validate_rejects_bad_weights_and_duplicates() {
        let mut settings = Settings::default();
        settings.consensus.weights.insert("extra".to_string(), 0.5);
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        for _ in 0..2 {
            settings.signal_sources.push(SignalSourceSettings {
                id: "tech".to_string(),
                base_url: "http://localhost".to_string(),
                requests_per_minute: 60,
            });
        }
        assert!(settings.validate().is_err());
    }
}
