use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::db::{BreakerStore, StoreError};
use crate::events::{BreakerEvent, EventBus};

/// Hard risk limits, owned by the operator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Cumulative realized losses allowed over the account lifetime
    pub hard_budget_limit: f64,
    /// Realized losses allowed within one UTC day
    pub daily_loss_limit: f64,
    /// Fraction of peak equity (0.2 = 20%)
    pub max_drawdown_limit: f64,
    /// Consecutive losing events that trip the breaker; 0 disables the check
    pub failure_threshold: u32,
    /// Window for counting consecutive failures, also the auto-heal delay
    pub failure_timeout_secs: u64,
    pub enable_kill_switch: bool,
    pub require_manual_reset: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            hard_budget_limit: 5_000.0,
            daily_loss_limit: 1_000.0,
            max_drawdown_limit: 0.20, // -20% from peak
            failure_threshold: 5,     // 5 losses in a row
            failure_timeout_secs: 3_600,
            enable_kill_switch: true,
            require_manual_reset: true,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn failure_timeout(&self) -> Duration {
        // Capped at ten years so the conversion cannot overflow
        Duration::seconds(self.failure_timeout_secs.min(315_360_000) as i64)
    }

    pub fn validate(&self) -> Result<(), BreakerError> {
        let positive = |name: &str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(BreakerError::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    name, value
                )))
            }
        };

        positive("hard_budget_limit", self.hard_budget_limit)?;
        positive("daily_loss_limit", self.daily_loss_limit)?;
        positive("max_drawdown_limit", self.max_drawdown_limit)?;

        if self.max_drawdown_limit > 1.0 {
            return Err(BreakerError::InvalidConfig(format!(
                "max_drawdown_limit is a fraction of peak equity, got {}",
                self.max_drawdown_limit
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Tripped,
}

/// Which limit tripped the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerTrip {
    HardBudget,
    DailyLoss,
    MaxDrawdown,
    ConsecutiveFailures,
}

impl CircuitBreakerTrip {
    /// Only a failure streak may clear itself; loss and drawdown trips need an operator
    pub fn auto_heals(&self) -> bool {
        matches!(self, CircuitBreakerTrip::ConsecutiveFailures)
    }
}

/// Cause of a published breaker transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerTrigger {
    HardBudget,
    DailyLoss,
    MaxDrawdown,
    ConsecutiveFailures,
    KillSwitchActivated,
    KillSwitchDeactivated,
    ManualReset,
    AutoReset,
    ConfigUpdated,
}

impl From<CircuitBreakerTrip> for BreakerTrigger {
    fn from(trip: CircuitBreakerTrip) -> Self {
        match trip {
            CircuitBreakerTrip::HardBudget => BreakerTrigger::HardBudget,
            CircuitBreakerTrip::DailyLoss => BreakerTrigger::DailyLoss,
            CircuitBreakerTrip::MaxDrawdown => BreakerTrigger::MaxDrawdown,
            CircuitBreakerTrip::ConsecutiveFailures => BreakerTrigger::ConsecutiveFailures,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerState {
    pub state: BreakerState,
    pub kill_switch_active: bool,
    pub kill_switch_reason: Option<String>,
    pub total_losses: f64,
    pub daily_loss: f64,
    /// UTC day `daily_loss` belongs to
    pub trading_day: NaiveDate,
    pub peak_equity: Option<f64>,
    /// Equity from the latest `record_equity`
    #[serde(default)]
    pub last_equity: Option<f64>,
    /// Worst drawdown ever seen; audit only, limits use the current drawdown
    pub max_drawdown_observed: f64,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub trip_trigger: Option<CircuitBreakerTrip>,
    pub trip_reason: Option<String>,
    pub tripped_at: Option<DateTime<Utc>>,
    pub manual_reset_required: bool,
}

impl CircuitBreakerState {
    pub fn new(trading_day: NaiveDate) -> Self {
        Self {
            state: BreakerState::Closed,
            kill_switch_active: false,
            kill_switch_reason: None,
            total_losses: 0.0,
            daily_loss: 0.0,
            trading_day,
            peak_equity: None,
            last_equity: None,
            max_drawdown_observed: 0.0,
            consecutive_failures: 0,
            last_failure_at: None,
            trip_trigger: None,
            trip_reason: None,
            tripped_at: None,
            manual_reset_required: false,
        }
    }

    fn roll_day(&mut self, today: NaiveDate) {
        if today != self.trading_day {
            self.trading_day = today;
            self.daily_loss = 0.0;
        }
    }

    /// Fraction below peak equity at the latest equity reading
    pub fn current_drawdown(&self) -> f64 {
        match (self.peak_equity, self.last_equity) {
            (Some(peak), Some(equity)) if peak > 0.0 => ((peak - equity) / peak).max(0.0),
            _ => 0.0,
        }
    }

    /// First limit the counters are past, in priority order
    pub fn breached_limit(
        &self,
        config: &CircuitBreakerConfig,
    ) -> Option<(CircuitBreakerTrip, String)> {
        if self.total_losses > config.hard_budget_limit {
            return Some((
                CircuitBreakerTrip::HardBudget,
                format!(
                    "total losses {:.2} exceed hard budget {:.2}",
                    self.total_losses, config.hard_budget_limit
                ),
            ));
        }

        if self.daily_loss > config.daily_loss_limit {
            return Some((
                CircuitBreakerTrip::DailyLoss,
                format!(
                    "daily loss {:.2} exceeds limit {:.2}",
                    self.daily_loss, config.daily_loss_limit
                ),
            ));
        }

        let drawdown = self.current_drawdown();
        if drawdown > config.max_drawdown_limit {
            return Some((
                CircuitBreakerTrip::MaxDrawdown,
                format!(
                    "drawdown {:.1}% exceeds limit {:.1}%",
                    drawdown * 100.0,
                    config.max_drawdown_limit * 100.0
                ),
            ));
        }

        if config.failure_threshold > 0 && self.consecutive_failures >= config.failure_threshold {
            return Some((
                CircuitBreakerTrip::ConsecutiveFailures,
                format!(
                    "{} consecutive failures (threshold {})",
                    self.consecutive_failures, config.failure_threshold
                ),
            ));
        }

        None
    }

    fn trip(
        &mut self,
        trip: CircuitBreakerTrip,
        reason: &str,
        config: &CircuitBreakerConfig,
        now: DateTime<Utc>,
    ) {
        self.state = BreakerState::Tripped;
        self.trip_trigger = Some(trip);
        self.trip_reason = Some(reason.to_string());
        self.tripped_at = Some(now);
        self.manual_reset_required = config.require_manual_reset || !trip.auto_heals();
    }

    fn clear(&mut self) {
        self.state = BreakerState::Closed;
        self.trip_trigger = None;
        self.trip_reason = None;
        self.tripped_at = None;
        self.manual_reset_required = false;
        self.consecutive_failures = 0;
    }

    /// Trip the breaker if a limit is breached and the breach is news.
    ///
    /// A healing failure trip is upgraded when a non-healing limit is breached.
    fn check_limits(
        &mut self,
        config: &CircuitBreakerConfig,
        now: DateTime<Utc>,
    ) -> Option<(BreakerTrigger, String)> {
        let (trip, reason) = self.breached_limit(config)?;

        let is_news = match self.state {
            BreakerState::Closed => true,
            BreakerState::Tripped => {
                self.trip_trigger != Some(trip)
                    && !trip.auto_heals()
                    && self.trip_trigger.map_or(false, |t| t.auto_heals())
            }
        };

        if !is_news {
            return None;
        }

        self.trip(trip, &reason, config, now);
        Some((trip.into(), reason))
    }

    fn auto_reset_due(&self, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> bool {
        self.state == BreakerState::Tripped
            && !self.manual_reset_required
            && self.trip_trigger.map_or(false, |t| t.auto_heals())
            && self
                .last_failure_at
                .map_or(true, |t| now - t >= config.failure_timeout())
    }
}

/// Durable form of one account's breaker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerRecord {
    pub config: CircuitBreakerConfig,
    pub state: CircuitBreakerState,
}

/// Read snapshot published after every committed mutation
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub account_id: String,
    pub config: CircuitBreakerConfig,
    pub state: CircuitBreakerState,
    pub persistence_fault: bool,
}

#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("circuit breaker state could not be persisted: {0}")]
    Persistence(#[from] StoreError),

    #[error("invalid circuit breaker config: {0}")]
    InvalidConfig(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(f64),
}

type Transitions = Vec<(BreakerTrigger, String)>;

/// Process-wide, ticker-agnostic trading gate.
///
/// Mutations are serialized behind one async mutex: each one is computed on a
/// copy, persisted, and only then committed. A failed write leaves the
/// committed state untouched and puts the breaker in a persistence fault,
/// which blocks execution until a later write succeeds.
pub struct CircuitBreaker {
    account_id: String,
    store: Arc<dyn BreakerStore>,
    events: EventBus,
    record: Mutex<BreakerRecord>,
    status: RwLock<Arc<BreakerStatus>>,
    tripped: AtomicBool,
    kill_switch: AtomicBool,
    persistence_fault: AtomicBool,
}

impl CircuitBreaker {
    /// Load the account's breaker from the store, creating it with
    /// `default_config` on first use.
    ///
    /// A stored config always wins over `default_config`; it only changes
    /// through [`CircuitBreaker::update_config`].
    pub async fn load(
        account_id: impl Into<String>,
        store: Arc<dyn BreakerStore>,
        events: EventBus,
        default_config: CircuitBreakerConfig,
    ) -> Result<Self, BreakerError> {
        let account_id = account_id.into();

        let record = match store.load_breaker(&account_id).await? {
            Some(record) => {
                if record.config != default_config {
                    tracing::info!(
                        "Stored circuit breaker config for {} differs from settings, keeping stored config",
                        account_id
                    );
                }
                if record.state.state == BreakerState::Tripped {
                    tracing::warn!(
                        "Circuit breaker for {} resumes TRIPPED: {}",
                        account_id,
                        record.state.trip_reason.as_deref().unwrap_or("unknown")
                    );
                }
                record
            }
            None => {
                default_config.validate()?;
                let record = BreakerRecord {
                    config: default_config,
                    state: CircuitBreakerState::new(Utc::now().date_naive()),
                };
                store.save_breaker(&account_id, &record).await?;
                tracing::info!("Initialized circuit breaker for {}", account_id);
                record
            }
        };

        let status = Arc::new(BreakerStatus {
            account_id: account_id.clone(),
            config: record.config.clone(),
            state: record.state.clone(),
            persistence_fault: false,
        });

        Ok(Self {
            tripped: AtomicBool::new(record.state.state == BreakerState::Tripped),
            kill_switch: AtomicBool::new(record.state.kill_switch_active),
            persistence_fault: AtomicBool::new(false),
            account_id,
            store,
            events,
            record: Mutex::new(record),
            status: RwLock::new(status),
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Whether trading is allowed right now, and why not if it isn't
    pub async fn can_execute(&self) -> (bool, String) {
        self.can_execute_at(Utc::now()).await
    }

    /// `can_execute` with an explicit clock (for replay and tests)
    pub async fn can_execute_at(&self, now: DateTime<Utc>) -> (bool, String) {
        let status = self.get_status();

        if status.state.auto_reset_due(&status.config, now) && !status.persistence_fault {
            let healed = self
                .mutate(now, |record, now| {
                    if !record.state.auto_reset_due(&record.config, now) {
                        return Ok(((), Vec::new()));
                    }
                    let reason = format!(
                        "no failures for {}s after: {}",
                        record.config.failure_timeout_secs,
                        record.state.trip_reason.as_deref().unwrap_or("failure streak")
                    );
                    record.state.clear();
                    Ok(((), vec![(BreakerTrigger::AutoReset, reason)]))
                })
                .await;

            if let Err(e) = healed {
                return (false, format!("PERSISTENCE_FAULT: {}", e));
            }
        }

        Self::admission(&self.get_status())
    }

    fn admission(status: &BreakerStatus) -> (bool, String) {
        if status.persistence_fault {
            return (
                false,
                "PERSISTENCE_FAULT: circuit breaker state could not be persisted".to_string(),
            );
        }

        if status.state.kill_switch_active {
            return (
                false,
                format!(
                    "KILL_SWITCH: {}",
                    status
                        .state
                        .kill_switch_reason
                        .as_deref()
                        .unwrap_or("activated by operator")
                ),
            );
        }

        if status.state.state == BreakerState::Tripped {
            return (
                false,
                format!(
                    "CIRCUIT_TRIPPED: {}",
                    status.state.trip_reason.as_deref().unwrap_or("unknown")
                ),
            );
        }

        (true, "OK".to_string())
    }

    /// Record a realized loss (positive amount). Returns true if this call tripped the breaker.
    pub async fn record_loss(&self, amount: f64) -> Result<bool, BreakerError> {
        self.record_loss_at(amount, Utc::now()).await
    }

    pub async fn record_loss_at(
        &self,
        amount: f64,
        now: DateTime<Utc>,
    ) -> Result<bool, BreakerError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(BreakerError::InvalidAmount(amount));
        }
        if amount == 0.0 {
            return Ok(false);
        }

        self.mutate(now, move |record, now| {
            let BreakerRecord { config, state } = record;

            state.total_losses += amount;
            state.daily_loss += amount;

            let within_window = state
                .last_failure_at
                .map_or(false, |t| now - t <= config.failure_timeout());
            state.consecutive_failures = if within_window {
                state.consecutive_failures.saturating_add(1)
            } else {
                1
            };
            state.last_failure_at = Some(now);

            tracing::debug!(
                "Recorded loss {:.2} (total {:.2}, daily {:.2}, streak {})",
                amount,
                state.total_losses,
                state.daily_loss,
                state.consecutive_failures
            );

            let transitions: Transitions = state.check_limits(config, now).into_iter().collect();
            Ok((!transitions.is_empty(), transitions))
        })
        .await
    }

    /// A winning close ends the failure streak
    pub async fn record_success(&self) -> Result<(), BreakerError> {
        self.mutate(Utc::now(), |record, _| {
            record.state.consecutive_failures = 0;
            Ok(((), Vec::new()))
        })
        .await
    }

    /// Feed the latest account equity for drawdown tracking.
    /// Returns true if this call tripped the breaker.
    pub async fn record_equity(&self, equity: f64) -> Result<bool, BreakerError> {
        self.record_equity_at(equity, Utc::now()).await
    }

    pub async fn record_equity_at(
        &self,
        equity: f64,
        now: DateTime<Utc>,
    ) -> Result<bool, BreakerError> {
        if !equity.is_finite() || equity < 0.0 {
            return Err(BreakerError::InvalidAmount(equity));
        }

        self.mutate(now, move |record, now| {
            let BreakerRecord { config, state } = record;

            let peak = state.peak_equity.map_or(equity, |p| p.max(equity));
            state.peak_equity = Some(peak);
            state.last_equity = Some(equity);
            state.max_drawdown_observed = state.max_drawdown_observed.max(state.current_drawdown());

            let transitions: Transitions = state.check_limits(config, now).into_iter().collect();
            Ok((!transitions.is_empty(), transitions))
        })
        .await
    }

    /// Close a tripped breaker. Refused (returns false) when the config requires
    /// a manual reset and `force` is not set. The kill switch is not touched.
    pub async fn manual_reset(&self, force: bool) -> Result<bool, BreakerError> {
        self.mutate(Utc::now(), move |record, _| {
            if record.state.state == BreakerState::Closed {
                return Ok((true, Vec::new()));
            }

            if record.config.require_manual_reset && !force {
                tracing::warn!("Manual reset refused: config requires a forced reset");
                return Ok((false, Vec::new()));
            }

            let reason = format!(
                "{}reset after: {}",
                if force { "forced " } else { "" },
                record.state.trip_reason.as_deref().unwrap_or("unknown")
            );
            record.state.clear();
            // The operator accepts the drawdown so far; measure from here
            if record.state.last_equity.is_some() {
                record.state.peak_equity = record.state.last_equity;
            }
            tracing::info!("Circuit breaker {}", reason);

            Ok((true, vec![(BreakerTrigger::ManualReset, reason)]))
        })
        .await
    }

    /// Emergency stop. Returns false when the config disables the kill switch.
    pub async fn activate_kill_switch(&self, reason: &str) -> Result<bool, BreakerError> {
        let reason = reason.to_string();
        self.mutate(Utc::now(), move |record, _| {
            if !record.config.enable_kill_switch {
                tracing::warn!("Kill switch activation refused: disabled in config");
                return Ok((false, Vec::new()));
            }
            if record.state.kill_switch_active {
                return Ok((true, Vec::new()));
            }

            record.state.kill_switch_active = true;
            record.state.kill_switch_reason = Some(reason.clone());
            tracing::warn!("KILL SWITCH ACTIVATED: {}", reason);

            Ok((true, vec![(BreakerTrigger::KillSwitchActivated, reason)]))
        })
        .await
    }

    pub async fn deactivate_kill_switch(&self) -> Result<bool, BreakerError> {
        self.mutate(Utc::now(), |record, _| {
            if !record.state.kill_switch_active {
                return Ok((true, Vec::new()));
            }

            record.state.kill_switch_active = false;
            record.state.kill_switch_reason = None;
            tracing::info!("Kill switch deactivated");

            Ok((
                true,
                vec![(
                    BreakerTrigger::KillSwitchDeactivated,
                    "deactivated by operator".to_string(),
                )],
            ))
        })
        .await
    }

    pub fn get_config(&self) -> CircuitBreakerConfig {
        self.get_status().config.clone()
    }

    /// Replace the config. New limits are evaluated immediately.
    pub async fn update_config(&self, config: CircuitBreakerConfig) -> Result<(), BreakerError> {
        config.validate()?;

        self.mutate(Utc::now(), move |record, now| {
            record.config = config;

            let BreakerRecord { config, state } = record;
            if let Some(trip) = state.trip_trigger {
                state.manual_reset_required = config.require_manual_reset || !trip.auto_heals();
            }

            let mut transitions: Transitions =
                vec![(BreakerTrigger::ConfigUpdated, "config updated".to_string())];
            transitions.extend(state.check_limits(config, now));
            Ok(((), transitions))
        })
        .await
    }

    /// Latest committed snapshot. Never waits on a pending write.
    pub fn get_status(&self) -> Arc<BreakerStatus> {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    pub fn is_kill_switch_active(&self) -> bool {
        self.kill_switch.load(Ordering::SeqCst)
    }

    /// Apply `f` to a copy of the record, persist it, then commit and publish.
    async fn mutate<T, F>(&self, now: DateTime<Utc>, f: F) -> Result<T, BreakerError>
    where
        T: Send,
        F: FnOnce(&mut BreakerRecord, DateTime<Utc>) -> Result<(T, Transitions), BreakerError>
            + Send,
    {
        let mut current = self.record.lock().await;

        let mut next = current.clone();
        next.state.roll_day(now.date_naive());
        let (output, transitions) = f(&mut next, now)?;

        // While faulted every mutation also retries the store
        let faulted = self.persistence_fault.load(Ordering::SeqCst);
        if next != *current || faulted {
            if let Err(e) = self.store.save_breaker(&self.account_id, &next).await {
                tracing::error!(
                    "Failed to persist circuit breaker for {}: {} (failing closed)",
                    self.account_id,
                    e
                );
                self.persistence_fault.store(true, Ordering::SeqCst);
                self.publish_status(&current);
                return Err(e.into());
            }

            if faulted {
                tracing::info!("Circuit breaker persistence recovered for {}", self.account_id);
            }
            self.persistence_fault.store(false, Ordering::SeqCst);
            *current = next;
            self.publish_status(&current);
        }

        for (trigger, reason) in transitions {
            if current.state.state == BreakerState::Tripped
                && !matches!(
                    trigger,
                    BreakerTrigger::ConfigUpdated
                        | BreakerTrigger::KillSwitchActivated
                        | BreakerTrigger::KillSwitchDeactivated
                )
            {
                tracing::warn!("🚨 CIRCUIT BREAKER TRIPPED ({:?}): {}", trigger, reason);
            }

            self.events.publish_breaker(BreakerEvent {
                state: current.state.state,
                kill_switch_active: current.state.kill_switch_active,
                trigger_type: trigger,
                reason,
                timestamp: now,
            });
        }

        Ok(output)
    }

    fn publish_status(&self, record: &BreakerRecord) {
        self.tripped.store(
            record.state.state == BreakerState::Tripped,
            Ordering::SeqCst,
        );
        self.kill_switch
            .store(record.state.kill_switch_active, Ordering::SeqCst);

        let status = Arc::new(BreakerStatus {
            account_id: self.account_id.clone(),
            config: record.config.clone(),
            state: record.state.clone(),
            persistence_fault: self.persistence_fault.load(Ordering::SeqCst),
        });

        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }
}
