use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::interval;
use tradegate::config::{self as settings_loader, Settings};
use tradegate::db::{BreakerStore, LedgerStore, MemoryStore, PostgresStore};
use tradegate::market::{HttpMarketData, MarketData, PriceBook};
use tradegate::persistence::RedisPriceCache;
use tradegate::signals::{HttpSignalSource, SignalAggregator, SignalSource};
use tradegate::{
    CircuitBreaker, CircuitBreakerConfig, ConsensusEngine, DecisionPipeline, EventBus, Result,
    TradeLedger,
};

// Cached prices older than this are not trusted for valuation
const PRICE_CACHE_MAX_AGE_HOURS: i64 = 24;

#[derive(Parser)]
#[command(name = "tradegate")]
#[command(about = "Consensus-gated paper trading with a circuit breaker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (defaults to ./tradegate.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Keep all state in memory instead of Postgres
    #[arg(long, global = true)]
    ephemeral: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run decision cycles for the configured tickers until Ctrl+C
    Run,

    /// Run a single decision cycle for one ticker
    Cycle { ticker: String },

    /// Show circuit breaker status and account balance
    Status,

    /// Show or change circuit breaker settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Block (on) or allow (off) all trading
    KillSwitch {
        #[command(subcommand)]
        action: KillSwitchAction,
    },

    /// Close a tripped circuit breaker
    Reset {
        /// Required when the breaker is configured for manual reset
        #[arg(long)]
        force: bool,
    },

    /// Report a realized loss to the circuit breaker
    RecordLoss { amount: f64 },

    /// List open positions
    Positions,

    /// Show executed orders, oldest first
    History {
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show the account balance
    Balance {
        /// Rebuild and store today's snapshot from the order log
        #[arg(long)]
        recalculate: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print effective settings and the stored breaker config
    Show,
    /// Set one circuit breaker field, e.g. `config set hard_budget_limit 2500`
    Set { key: String, value: String },
}

#[derive(Subcommand)]
enum KillSwitchAction {
    On {
        #[arg(short, long, default_value = "activated from CLI")]
        reason: String,
    },
    Off,
}

struct App {
    settings: Settings,
    events: EventBus,
    breaker: Arc<CircuitBreaker>,
    ledger: Arc<TradeLedger>,
    price_cache: Option<RedisPriceCache>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = settings_loader::load(cli.config.as_deref()).context("Failed to load settings")?;
    settings.validate().context("Invalid settings")?;

    let mut app = build_app(settings, cli.ephemeral).await?;

    match cli.command {
        Commands::Run => run(&mut app).await?,
        Commands::Cycle { ticker } => {
            let pipeline = build_pipeline(&app)?;
            let _events = spawn_event_logger(&app.events);
            let report = pipeline.run_cycle(&ticker).await?;
            print_json(&report)?;
            save_price_cache(&mut app).await;
        }
        Commands::Status => {
            print_json(&*app.breaker.get_status())?;
            print_json(&app.ledger.get_current_balance())?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                print_json(&app.settings)?;
                println!("Stored circuit breaker config:");
                print_json(&app.breaker.get_config())?;
            }
            ConfigAction::Set { key, value } => {
                let config = apply_breaker_setting(app.breaker.get_config(), &key, &value)?;
                app.breaker.update_config(config).await?;
                print_json(&app.breaker.get_config())?;
            }
        },
        Commands::KillSwitch { action } => match action {
            KillSwitchAction::On { reason } => {
                if app.breaker.activate_kill_switch(&reason).await? {
                    println!("Kill switch ON: {}", reason);
                } else {
                    println!("Kill switch is disabled in the circuit breaker config");
                }
            }
            KillSwitchAction::Off => {
                app.breaker.deactivate_kill_switch().await?;
                println!("Kill switch OFF");
            }
        },
        Commands::Reset { force } => {
            if app.breaker.manual_reset(force).await? {
                println!("Circuit breaker closed");
            } else {
                println!("Reset refused: manual reset required, pass --force");
            }
        }
        Commands::RecordLoss { amount } => {
            let tripped = app.breaker.record_loss(amount).await?;
            println!(
                "Recorded loss ${:.2}{}",
                amount,
                if tripped { ", circuit breaker TRIPPED" } else { "" }
            );
        }
        Commands::Positions => print_json(&app.ledger.get_positions())?,
        Commands::History { limit } => print_json(&app.ledger.get_trade_history(limit))?,
        Commands::Balance { recalculate } => {
            if recalculate {
                print_json(&app.ledger.update_daily_equity().await?)?;
            } else {
                print_json(&app.ledger.get_current_balance())?;
            }
        }
    }

    Ok(())
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tradegate=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open_stores(
    settings: &Settings,
    ephemeral: bool,
) -> Result<(Arc<dyn LedgerStore>, Arc<dyn BreakerStore>)> {
    if ephemeral {
        tracing::warn!("Ephemeral session: nothing will be persisted");
        let store = Arc::new(MemoryStore::new());
        let ledger_store: Arc<dyn LedgerStore> = store.clone();
        let breaker_store: Arc<dyn BreakerStore> = store;
        return Ok((ledger_store, breaker_store));
    }

    // No silent fallback: trading without durable state is refused
    let database_url = settings
        .database_url
        .as_deref()
        .context("database_url is not set (use --ephemeral for an in-memory session)")?;

    let store = Arc::new(
        PostgresStore::new(database_url)
            .await
            .context("Failed to connect to Postgres")?,
    );
    let ledger_store: Arc<dyn LedgerStore> = store.clone();
    let breaker_store: Arc<dyn BreakerStore> = store;
    Ok((ledger_store, breaker_store))
}

async fn connect_price_cache(settings: &Settings) -> Option<RedisPriceCache> {
    let redis_url = settings.redis_url.as_deref()?;

    match RedisPriceCache::new(redis_url).await {
        Ok(cache) => Some(cache),
        Err(e) => {
            tracing::warn!("Redis unavailable, running without price cache: {:#}", e);
            None
        }
    }
}

async fn build_app(settings: Settings, ephemeral: bool) -> Result<App> {
    let events = EventBus::default();
    let (ledger_store, breaker_store) = open_stores(&settings, ephemeral).await?;

    let breaker = Arc::new(
        CircuitBreaker::load(
            settings.account.id.clone(),
            breaker_store,
            events.clone(),
            settings.circuit_breaker.clone(),
        )
        .await
        .context("Failed to load circuit breaker")?,
    );

    let market: Option<Arc<dyn MarketData>> = match settings.market_data_url.as_deref() {
        Some(url) => Some(Arc::new(HttpMarketData::new(url)?)),
        None => {
            tracing::warn!("No market_data_url configured, using last known prices only");
            None
        }
    };
    let prices = Arc::new(PriceBook::new(market, settings.pipeline.quote_timeout()));

    let mut price_cache = connect_price_cache(&settings).await;
    if let Some(cache) = price_cache.as_mut() {
        match cache
            .load_prices(
                &settings.account.id,
                Some(chrono::Duration::hours(PRICE_CACHE_MAX_AGE_HOURS)),
            )
            .await
        {
            Ok(cached) => prices.seed(cached),
            Err(e) => tracing::warn!("Failed to load cached prices: {:#}", e),
        }
    }

    let ledger = Arc::new(
        TradeLedger::open(settings.ledger_config(), ledger_store, breaker.clone(), prices)
            .await
            .context("Failed to open trade ledger")?,
    );

    Ok(App {
        settings,
        events,
        breaker,
        ledger,
        price_cache,
    })
}

fn build_pipeline(app: &App) -> Result<DecisionPipeline> {
    let settings = &app.settings;

    let mut sources: Vec<Arc<dyn SignalSource>> = Vec::new();
    for source in &settings.signal_sources {
        sources.push(Arc::new(HttpSignalSource::new(
            source.id.clone(),
            source.base_url.clone(),
            source.requests_per_minute,
        )?));
    }
    if sources.is_empty() {
        tracing::warn!("No signal sources configured, every cycle will HOLD");
    }

    let engine = ConsensusEngine::new(settings.consensus.engine_config())?;
    let weights = settings.consensus.weights()?;

    DecisionPipeline::new(
        SignalAggregator::new(sources, settings.consensus.source_timeout()),
        engine,
        weights,
        app.ledger.clone(),
        app.events.clone(),
        settings.pipeline.pipeline_config(),
    )
}

// ============================================================================
// Run Loop
// ============================================================================

async fn run(app: &mut App) -> Result<()> {
    let tickers = app.settings.pipeline.tickers.clone();
    if tickers.is_empty() {
        anyhow::bail!("No tickers configured (pipeline.tickers)");
    }

    let pipeline = build_pipeline(app)?;
    let event_logger = spawn_event_logger(&app.events);

    tracing::info!("🚀 tradegate starting for account {}", app.ledger.account_id());
    tracing::info!("  Tickers: {}", tickers.join(", "));
    tracing::info!("  Interval: {:?}", app.settings.pipeline.interval());
    tracing::info!("  Cash: ${:.2}", app.ledger.cash());
    tracing::info!("\nPress Ctrl+C to stop...\n");

    let mut ticker = interval(app.settings.pipeline.interval());
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
                break;
            }
            _ = ticker.tick() => {
                run_round(app, &pipeline, &tickers).await;
            }
        }
    }

    save_price_cache(app).await;
    event_logger.abort();

    tracing::info!("👋 tradegate stopped");
    Ok(())
}

async fn run_round(app: &mut App, pipeline: &DecisionPipeline, tickers: &[String]) {
    for (ticker, result) in pipeline.run_all(tickers).await {
        if let Err(e) = result {
            tracing::error!("Cycle for {} failed: {}", ticker, e);
        }
    }

    match app.ledger.update_daily_equity().await {
        Ok(snapshot) => tracing::info!(
            "📊 Equity ${:.2} (daily P&L ${:.2})",
            snapshot.total_equity,
            snapshot.daily_pnl
        ),
        Err(e) => tracing::error!("Failed to update daily equity: {}", e),
    }

    save_price_cache(app).await;
}

async fn save_price_cache(app: &mut App) {
    let Some(cache) = app.price_cache.as_mut() else {
        return;
    };
    let prices = app.ledger.prices().snapshot();
    if let Err(e) = cache.save_prices(app.ledger.account_id(), &prices).await {
        tracing::warn!("Failed to cache prices: {:#}", e);
    }
}

fn spawn_event_logger(events: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut decisions = events.subscribe_decisions();
    let mut breaker = events.subscribe_breaker();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = decisions.recv() => match event {
                    Ok(event) => tracing::debug!(
                        "Decision {} {} score {:.3} order={} rejection={}",
                        event.ticker,
                        event.signal,
                        event.consensus_score,
                        event.order.is_some(),
                        event.rejection.as_ref().map_or("-", |r| r.code())
                    ),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Event logger missed {} decision events", missed)
                    }
                    Err(RecvError::Closed) => break,
                },
                event = breaker.recv() => match event {
                    Ok(event) => tracing::warn!(
                        "🚨 Circuit breaker {:?} ({:?}): {}",
                        event.state,
                        event.trigger_type,
                        event.reason
                    ),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Event logger missed {} breaker events", missed)
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Change one field of the breaker config; the value is read as JSON, falling
/// back to a plain string
fn apply_breaker_setting(
    config: CircuitBreakerConfig,
    key: &str,
    value: &str,
) -> Result<CircuitBreakerConfig> {
    let mut json = serde_json::to_value(config)?;
    let fields = json
        .as_object_mut()
        .context("circuit breaker config is not an object")?;

    if !fields.contains_key(key) {
        let known: Vec<&str> = fields.keys().map(String::as_str).collect();
        anyhow::bail!("Unknown circuit breaker setting {} (known: {})", key, known.join(", "));
    }

    let parsed = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    fields.insert(key.to_string(), parsed);

    serde_json::from_value(json).with_context(|| format!("Invalid value {} for {}", value, key))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
