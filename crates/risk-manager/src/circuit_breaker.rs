//! Circuit breaker for emergency trading halts.
//!
//! One breaker instance is the single authority on whether trading may
//! proceed. It is shared by reference (`Arc<CircuitBreaker>`) between the
//! trading cycle and any administrative caller; every read-modify-write
//! happens under one mutex and is followed by a full-state write while the
//! lock is still held. With persistence, the state file is re-read on every
//! operation, so an override written by another process (such as the
//! kill-switch command) takes effect in a running trader.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use trading_core::config::CircuitBreakerConfig;

use crate::state_store::JsonStateStore;

/// Position of the breaker in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Trading allowed.
    Closed,
    /// Trading halted.
    Open,
    /// Probation window after the timeout; one loss re-opens.
    HalfOpen,
}

/// What tripped the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    /// Cumulative losses reached the hard budget.
    HardBudgetLimit,
    /// Losses within the current UTC day reached the daily limit.
    DailyLossLimit,
    /// Portfolio drawdown from initial capital exceeded the limit.
    MaxDrawdown,
    /// Manual override.
    EmergencyKillSwitch,
    /// A loss was recorded during the half-open probation.
    HalfOpenFailure,
}

/// Persisted state of the circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub trigger_type: Option<TriggerType>,
    pub trigger_reason: Option<String>,
    pub triggered_at: Option<DateTime<Utc>>,
    /// Losses recorded since the last reset.
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub success_count_in_half_open: u32,
    /// Cumulative recorded losses (negative).
    pub total_losses: Decimal,
    /// Most negative single loss recorded.
    pub peak_loss: Decimal,
    pub kill_switch_active: bool,
    pub manual_reset_required: bool,
    pub reset_at: Option<DateTime<Utc>>,
    /// Losses recorded during `trading_day` (negative).
    #[serde(default)]
    pub daily_losses: Decimal,
    #[serde(default)]
    pub trading_day: Option<NaiveDate>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            trigger_type: None,
            trigger_reason: None,
            triggered_at: None,
            failure_count: 0,
            last_failure_at: None,
            success_count_in_half_open: 0,
            total_losses: Decimal::ZERO,
            peak_loss: Decimal::ZERO,
            kill_switch_active: false,
            manual_reset_required: false,
            reset_at: None,
            daily_losses: Decimal::ZERO,
            trading_day: None,
            metadata: HashMap::new(),
        }
    }
}

/// Notification emitted on state changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BreakerEvent {
    Tripped {
        trigger_type: TriggerType,
        reason: String,
    },
    HalfOpened,
    Reset,
    KillSwitchActivated {
        reason: String,
    },
    KillSwitchDeactivated,
}

/// Answer to "may we trade right now?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permit {
    pub allowed: bool,
    pub reason: String,
}

impl Permit {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn refuse(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// Result of a portfolio drawdown check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    /// Fractional loss from initial capital; zero when in profit.
    pub drawdown: Decimal,
    pub healthy: bool,
}

pub type BreakerCallback = Arc<dyn Fn(&BreakerEvent) + Send + Sync>;

/// Circuit breaker for emergency trading halts.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
    /// File repository for persistence.
    store: Option<JsonStateStore>,
    callbacks: RwLock<Vec<(String, BreakerCallback)>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("store", &self.store)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker without persistence.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CircuitBreakerState::default()),
            store: None,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Create a circuit breaker backed by a state file, loading any
    /// previous state. A missing or unreadable file starts CLOSED.
    pub fn with_persistence(config: CircuitBreakerConfig, path: impl Into<PathBuf>) -> Self {
        let store = JsonStateStore::new(path);
        let state = match store.load() {
            Ok(Some(state)) => {
                info!(
                    path = %store.path().display(),
                    state = ?state.state,
                    trigger_type = ?state.trigger_type,
                    total_losses = %state.total_losses,
                    kill_switch_active = state.kill_switch_active,
                    "Loaded circuit breaker state"
                );
                state
            }
            Ok(None) => {
                info!(
                    path = %store.path().display(),
                    "No circuit breaker state found, starting closed"
                );
                CircuitBreakerState::default()
            }
            Err(e) => {
                error!(
                    path = %store.path().display(),
                    error = %e,
                    "Failed to load circuit breaker state, starting closed"
                );
                CircuitBreakerState::default()
            }
        };

        Self {
            config,
            state: Mutex::new(state),
            store: Some(store),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Build from configuration, persisting when a state path is set.
    pub fn from_config(config: CircuitBreakerConfig) -> Self {
        match config.state_path.clone() {
            Some(path) => Self::with_persistence(config, path),
            None => Self::new(config),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Register a named callback, replacing any with the same name.
    pub fn on_event<F>(&self, name: impl Into<String>, callback: F)
    where
        F: Fn(&BreakerEvent) + Send + Sync + 'static,
    {
        let name = name.into();
        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        callbacks.retain(|(existing, _)| *existing != name);
        callbacks.push((name, Arc::new(callback)));
    }

    pub fn remove_callback(&self, name: &str) -> bool {
        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| existing != name);
        callbacks.len() != before
    }

    /// Get current state.
    pub fn state(&self) -> CircuitBreakerState {
        self.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.lock().state == CircuitState::Open
    }

    /// Check if trading is allowed, advancing OPEN to HALF_OPEN once the
    /// failure timeout has elapsed since the persisted trip time.
    pub fn can_execute(&self) -> Permit {
        let mut events = Vec::new();
        let permit = {
            let mut state = self.lock();

            if state.kill_switch_active {
                return Permit::refuse(format!(
                    "kill switch active: {}",
                    state.trigger_reason.as_deref().unwrap_or("no reason given")
                ));
            }
            if !self.config.enabled {
                return Permit::allow("circuit breaker disabled");
            }

            match state.state {
                CircuitState::Closed => Permit::allow("circuit closed"),
                CircuitState::HalfOpen => Permit::allow("half-open probe"),
                CircuitState::Open => {
                    let now = Utc::now();
                    let triggered_at = match state.triggered_at {
                        Some(at) => at,
                        None => {
                            warn!("Open circuit breaker has no trip time, restarting timeout");
                            state.triggered_at = Some(now);
                            self.persist(&state);
                            now
                        }
                    };
                    let elapsed = now - triggered_at;

                    // Windows too large for a duration never elapse
                    let auto_reset_due = self
                        .config
                        .auto_reset_hours
                        .and_then(Duration::try_hours)
                        .is_some_and(|window| elapsed >= window);
                    if auto_reset_due {
                        info!(
                            elapsed_hours = elapsed.num_hours(),
                            "Auto-reset window passed, closing circuit breaker"
                        );
                        Self::reset_counters(&mut state, now);
                        self.persist(&state);
                        events.push(BreakerEvent::Reset);
                    }
                    let timeout = Duration::try_seconds(self.config.failure_timeout_secs);

                    if state.state == CircuitState::Closed {
                        Permit::allow("circuit auto-reset")
                    } else if state.manual_reset_required {
                        Permit::refuse(format!(
                            "circuit open ({}), manual reset required",
                            describe_trigger(&state)
                        ))
                    } else if timeout.is_some_and(|timeout| elapsed >= timeout) {
                        state.state = CircuitState::HalfOpen;
                        state.success_count_in_half_open = 0;
                        self.persist(&state);
                        info!(
                            elapsed_secs = elapsed.num_seconds(),
                            "Failure timeout elapsed, circuit breaker half-open"
                        );
                        events.push(BreakerEvent::HalfOpened);
                        Permit::allow("half-open probe")
                    } else {
                        let remaining = timeout
                            .and_then(|timeout| timeout.checked_sub(&elapsed))
                            .map(|remaining| remaining.num_seconds())
                            .unwrap_or(self.config.failure_timeout_secs);
                        Permit::refuse(format!(
                            "circuit open ({}), {}s until half-open",
                            describe_trigger(&state),
                            remaining
                        ))
                    }
                }
            }
        };

        self.emit(&events);
        permit
    }

    /// Record a realized loss. Amounts are treated as losses regardless of
    /// sign. Returns the trigger if this loss tripped the breaker.
    pub fn record_loss(&self, amount: Decimal) -> Option<TriggerType> {
        if !self.config.enabled {
            return None;
        }
        let loss = -amount.abs();
        if loss.is_zero() {
            return None;
        }

        let mut events = Vec::new();
        let tripped = {
            let mut state = self.lock();
            let now = Utc::now();
            Self::roll_trading_day(&mut state, now);

            state.total_losses += loss;
            state.daily_losses += loss;
            state.failure_count += 1;
            state.last_failure_at = Some(now);
            if loss < state.peak_loss {
                state.peak_loss = loss;
            }

            debug!(
                loss = %loss,
                total_losses = %state.total_losses,
                daily_losses = %state.daily_losses,
                state = ?state.state,
                "Recorded loss"
            );

            let breach = match state.state {
                CircuitState::Open => None,
                CircuitState::Closed => self.threshold_breach(&state),
                CircuitState::HalfOpen => Some(self.threshold_breach(&state).unwrap_or_else(|| {
                    (
                        TriggerType::HalfOpenFailure,
                        format!("loss of {} during half-open probation", loss),
                    )
                })),
            };

            let tripped = breach.map(|(trigger_type, reason)| {
                Self::trip(&mut state, &self.config, trigger_type, reason.clone(), now);
                events.push(BreakerEvent::Tripped {
                    trigger_type,
                    reason,
                });
                trigger_type
            });

            self.persist(&state);
            tripped
        };

        self.emit(&events);
        tripped
    }

    /// Record a successful trade. Closes the breaker after enough
    /// consecutive successes in HALF_OPEN; otherwise a no-op.
    pub fn record_success(&self) -> CircuitState {
        let mut events = Vec::new();
        let current = {
            let mut state = self.lock();
            if state.state != CircuitState::HalfOpen {
                return state.state;
            }

            state.success_count_in_half_open += 1;
            let threshold = self.config.half_open_success_threshold;
            info!(
                successes = state.success_count_in_half_open,
                threshold = threshold,
                "Half-open success recorded"
            );

            if state.success_count_in_half_open >= threshold {
                Self::reset_counters(&mut state, Utc::now());
                info!("Half-open probation passed, circuit breaker closed");
                events.push(BreakerEvent::Reset);
            }

            self.persist(&state);
            state.state
        };

        self.emit(&events);
        current
    }

    /// Force the breaker open until `deactivate_kill_switch()`.
    pub fn activate_kill_switch(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut state = self.lock();
            let now = Utc::now();
            state.state = CircuitState::Open;
            state.trigger_type = Some(TriggerType::EmergencyKillSwitch);
            state.trigger_reason = Some(reason.clone());
            state.triggered_at = Some(now);
            state.success_count_in_half_open = 0;
            state.kill_switch_active = true;

            error!(reason = %reason, "KILL SWITCH ACTIVATED - trading halted");
            self.persist(&state);
        }

        self.emit(&[BreakerEvent::KillSwitchActivated { reason }]);
    }

    /// Release the kill switch and return the breaker to CLOSED.
    /// Returns false if the kill switch was not active.
    pub fn deactivate_kill_switch(&self) -> bool {
        {
            let mut state = self.lock();
            if !state.kill_switch_active {
                return false;
            }
            state.kill_switch_active = false;
            Self::reset_counters(&mut state, Utc::now());

            warn!("Kill switch deactivated, circuit breaker closed");
            self.persist(&state);
        }

        self.emit(&[BreakerEvent::KillSwitchDeactivated, BreakerEvent::Reset]);
        true
    }

    /// Manually reset to CLOSED. Refused while the kill switch is active.
    pub fn reset(&self) -> bool {
        {
            let mut state = self.lock();
            if state.kill_switch_active {
                warn!("Reset refused: kill switch is active");
                return false;
            }
            Self::reset_counters(&mut state, Utc::now());
            self.persist(&state);
            info!("Circuit breaker reset");
        }

        self.emit(&[BreakerEvent::Reset]);
        true
    }

    /// Trip on excessive drawdown from initial capital.
    pub fn check_portfolio_health(
        &self,
        current_value: Decimal,
        initial_value: Decimal,
    ) -> HealthReport {
        let drawdown = if initial_value > Decimal::ZERO {
            ((initial_value - current_value) / initial_value).max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };
        let healthy = drawdown < self.config.max_drawdown_limit;

        let mut events = Vec::new();
        {
            let mut state = self.lock();
            state.metadata.insert(
                "last_drawdown".to_string(),
                serde_json::Value::String(drawdown.to_string()),
            );
            state.metadata.insert(
                "last_portfolio_value".to_string(),
                serde_json::Value::String(current_value.to_string()),
            );

            if !healthy && self.config.enabled && state.state != CircuitState::Open {
                let reason = format!(
                    "drawdown {} exceeds limit {} (value {} vs initial {})",
                    drawdown.round_dp(4),
                    self.config.max_drawdown_limit,
                    current_value,
                    initial_value
                );
                Self::trip(
                    &mut state,
                    &self.config,
                    TriggerType::MaxDrawdown,
                    reason.clone(),
                    Utc::now(),
                );
                events.push(BreakerEvent::Tripped {
                    trigger_type: TriggerType::MaxDrawdown,
                    reason,
                });
            }

            self.persist(&state);
        }

        self.emit(&events);
        HealthReport { drawdown, healthy }
    }

    // Private methods

    /// Lock the state, first adopting whatever the state file holds.
    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(store) = &self.store {
            match store.load() {
                Ok(Some(on_disk)) if on_disk != *state => {
                    if on_disk.state != state.state
                        || on_disk.kill_switch_active != state.kill_switch_active
                    {
                        info!(
                            state = ?on_disk.state,
                            trigger_type = ?on_disk.trigger_type,
                            kill_switch_active = on_disk.kill_switch_active,
                            "Circuit breaker state changed on disk"
                        );
                    }
                    *state = on_disk;
                }
                Ok(_) => {}
                Err(e) => warn!(
                    path = %store.path().display(),
                    error = %e,
                    "Failed to reload circuit breaker state, keeping in-memory state"
                ),
            }
        }
        state
    }

    /// Persist current state (if configured). Failures are logged only.
    fn persist(&self, state: &CircuitBreakerState) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(state) {
                error!(error = %e, "Failed to persist circuit breaker state");
            }
        }
    }

    fn emit(&self, events: &[BreakerEvent]) {
        if events.is_empty() {
            return;
        }
        let callbacks: Vec<(String, BreakerCallback)> = self
            .callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for event in events {
            for (name, callback) in &callbacks {
                debug!(callback = %name, event = ?event, "Dispatching breaker event");
                callback(event);
            }
        }
    }

    fn threshold_breach(&self, state: &CircuitBreakerState) -> Option<(TriggerType, String)> {
        if state.total_losses <= self.config.hard_budget_limit {
            return Some((
                TriggerType::HardBudgetLimit,
                format!(
                    "total losses {} breached hard budget limit {}",
                    state.total_losses, self.config.hard_budget_limit
                ),
            ));
        }
        if state.daily_losses <= self.config.daily_loss_limit {
            return Some((
                TriggerType::DailyLossLimit,
                format!(
                    "daily losses {} breached daily loss limit {}",
                    state.daily_losses, self.config.daily_loss_limit
                ),
            ));
        }
        None
    }

    fn trip(
        state: &mut CircuitBreakerState,
        config: &CircuitBreakerConfig,
        trigger_type: TriggerType,
        reason: String,
        now: DateTime<Utc>,
    ) {
        state.state = CircuitState::Open;
        state.trigger_type = Some(trigger_type);
        state.trigger_reason = Some(reason);
        state.triggered_at = Some(now);
        state.success_count_in_half_open = 0;
        if config.manual_reset_required {
            state.manual_reset_required = true;
        }

        error!(
            trigger_type = ?trigger_type,
            reason = ?state.trigger_reason,
            total_losses = %state.total_losses,
            failure_timeout_secs = config.failure_timeout_secs,
            "Circuit breaker TRIPPED - trading halted"
        );
    }

    fn reset_counters(state: &mut CircuitBreakerState, now: DateTime<Utc>) {
        state.state = CircuitState::Closed;
        state.trigger_type = None;
        state.trigger_reason = None;
        state.triggered_at = None;
        state.failure_count = 0;
        state.success_count_in_half_open = 0;
        state.total_losses = Decimal::ZERO;
        state.daily_losses = Decimal::ZERO;
        state.peak_loss = Decimal::ZERO;
        state.manual_reset_required = false;
        state.reset_at = Some(now);
    }

    fn roll_trading_day(state: &mut CircuitBreakerState, now: DateTime<Utc>) {
        let today = now.date_naive();
        if state.trading_day != Some(today) {
            if state.trading_day.is_some() {
                info!(
                    previous = ?state.trading_day,
                    today = %today,
                    "New trading day, clearing daily losses"
                );
            }
            state.daily_losses = Decimal::ZERO;
            state.trading_day = Some(today);
        }
    }
}

fn describe_trigger(state: &CircuitBreakerState) -> String {
    match (&state.trigger_type, &state.trigger_reason) {
        (Some(t), Some(r)) => format!("{:?}: {}", t, r),
        (Some(t), None) => format!("{:?}", t),
        _ => "unknown trigger".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            hard_budget_limit: Decimal::new(-100_000, 0),
            daily_loss_limit: Decimal::new(-500_000, 0),
            max_drawdown_limit: Decimal::new(20, 2),
            failure_timeout_secs: 3600,
            half_open_success_threshold: 3,
            auto_reset_hours: None,
            manual_reset_required: false,
            state_path: None,
        }
    }

    fn immediate_probe() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_timeout_secs: 0,
            ..config()
        }
    }

    #[test]
    fn test_hard_budget_trip() {
        let breaker = CircuitBreaker::new(config());

        assert_eq!(breaker.record_loss(Decimal::new(-60_000, 0)), None);
        assert!(breaker.can_execute().is_allowed());

        let trigger = breaker.record_loss(Decimal::new(-50_000, 0));
        assert_eq!(trigger, Some(TriggerType::HardBudgetLimit));

        let state = breaker.state();
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.total_losses, Decimal::new(-110_000, 0));
        assert_eq!(state.trigger_type, Some(TriggerType::HardBudgetLimit));
        assert!(state.triggered_at.is_some());
        assert_eq!(state.failure_count, 2);
        assert_eq!(state.peak_loss, Decimal::new(-60_000, 0));

        let permit = breaker.can_execute();
        assert!(!permit.is_allowed());
        assert!(permit.reason.contains("until half-open"));
    }

    #[test]
    fn test_positive_amounts_count_as_losses() {
        let breaker = CircuitBreaker::new(config());
        breaker.record_loss(Decimal::new(250, 0));
        assert_eq!(breaker.state().total_losses, Decimal::new(-250, 0));
    }

    #[test]
    fn test_daily_loss_trip() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            daily_loss_limit: Decimal::new(-1_000, 0),
            ..config()
        });
        for _ in 0..9 {
            assert!(breaker.record_loss(Decimal::new(-100, 0)).is_none());
        }
        assert_eq!(
            breaker.record_loss(Decimal::new(-100, 0)),
            Some(TriggerType::DailyLossLimit)
        );
        assert!(breaker.is_open());
    }

    #[test]
    fn test_half_open_after_timeout() {
        let breaker = CircuitBreaker::new(immediate_probe());
        breaker.record_loss(Decimal::new(-200_000, 0));
        assert!(breaker.is_open());

        let permit = breaker.can_execute();
        assert!(permit.is_allowed());
        assert_eq!(breaker.state().state, CircuitState::HalfOpen);
    }

    #[test]
    fn test_exact_success_threshold_closes() {
        let breaker = CircuitBreaker::new(immediate_probe());
        breaker.record_loss(Decimal::new(-200_000, 0));
        breaker.can_execute();

        assert_eq!(breaker.record_success(), CircuitState::HalfOpen);
        assert_eq!(breaker.record_success(), CircuitState::HalfOpen);
        assert_eq!(breaker.record_success(), CircuitState::Closed);

        let state = breaker.state();
        assert_eq!(state.total_losses, Decimal::ZERO);
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.success_count_in_half_open, 0);
        assert!(state.reset_at.is_some());
    }

    #[test]
    fn test_loss_during_half_open_retrips() {
        let breaker = CircuitBreaker::new(immediate_probe());
        breaker.record_loss(Decimal::new(-200_000, 0));
        breaker.can_execute();
        breaker.record_success();

        let trigger = breaker.record_loss(Decimal::new(-1, 0));
        assert!(trigger.is_some());
        let state = breaker.state();
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.success_count_in_half_open, 0);
    }

    #[test]
    fn test_small_half_open_loss_is_half_open_failure() {
        let breaker = CircuitBreaker::new(immediate_probe());
        // Drawdown trips without any recorded loss
        breaker.check_portfolio_health(Decimal::new(70_000, 0), Decimal::new(100_000, 0));
        assert!(breaker.is_open());
        assert!(breaker.can_execute().is_allowed());
        assert_eq!(breaker.state().state, CircuitState::HalfOpen);

        assert_eq!(
            breaker.record_loss(Decimal::new(-10, 0)),
            Some(TriggerType::HalfOpenFailure)
        );
        assert!(breaker.is_open());
    }

    #[test]
    fn test_record_success_when_closed_is_noop() {
        let breaker = CircuitBreaker::new(config());
        assert_eq!(breaker.record_success(), CircuitState::Closed);
        assert!(breaker.state().reset_at.is_none());
    }

    #[test]
    fn test_kill_switch_overrides_timeout() {
        let breaker = CircuitBreaker::new(immediate_probe());
        breaker.activate_kill_switch("operator halt");

        let state = breaker.state();
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.trigger_type, Some(TriggerType::EmergencyKillSwitch));
        assert!(state.kill_switch_active);

        // Zero timeout would otherwise move to half-open immediately
        for _ in 0..3 {
            let permit = breaker.can_execute();
            assert!(!permit.is_allowed());
            assert!(permit.reason.contains("operator halt"));
        }
        assert!(!breaker.reset());

        assert!(breaker.deactivate_kill_switch());
        assert!(breaker.can_execute().is_allowed());
        assert_eq!(breaker.state().state, CircuitState::Closed);
        assert!(!breaker.deactivate_kill_switch());
    }

    #[test]
    fn test_kill_switch_applies_when_disabled() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            enabled: false,
            ..config()
        });
        assert!(breaker.record_loss(Decimal::new(-1_000_000, 0)).is_none());
        assert!(breaker.can_execute().is_allowed());

        breaker.activate_kill_switch("halt");
        assert!(!breaker.can_execute().is_allowed());
    }

    #[test]
    fn test_manual_reset_required() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            manual_reset_required: true,
            ..immediate_probe()
        });
        breaker.record_loss(Decimal::new(-200_000, 0));
        assert!(breaker.state().manual_reset_required);

        let permit = breaker.can_execute();
        assert!(!permit.is_allowed());
        assert!(permit.reason.contains("manual reset"));

        assert!(breaker.reset());
        assert!(breaker.can_execute().is_allowed());
        assert!(!breaker.state().manual_reset_required);
    }

    #[test]
    fn test_drawdown_trip() {
        let breaker = CircuitBreaker::new(config());
        let initial = Decimal::new(100_000, 0);

        let report = breaker.check_portfolio_health(Decimal::new(110_000, 0), initial);
        assert_eq!(report.drawdown, Decimal::ZERO);
        assert!(report.healthy);

        let report = breaker.check_portfolio_health(Decimal::new(85_000, 0), initial);
        assert_eq!(report.drawdown, Decimal::new(15, 2));
        assert!(report.healthy);
        assert!(!breaker.is_open());

        let report = breaker.check_portfolio_health(Decimal::new(79_000, 0), initial);
        assert!(!report.healthy);
        let state = breaker.state();
        assert_eq!(state.trigger_type, Some(TriggerType::MaxDrawdown));
        assert_eq!(state.state, CircuitState::Open);
    }

    #[test]
    fn test_callbacks_receive_events() {
        let breaker = CircuitBreaker::new(immediate_probe());
        let trips = Arc::new(AtomicUsize::new(0));
        let resets = Arc::new(AtomicUsize::new(0));

        let t = Arc::clone(&trips);
        breaker.on_event("trip-counter", move |event| {
            if matches!(event, BreakerEvent::Tripped { .. }) {
                t.fetch_add(1, Ordering::SeqCst);
            }
        });
        let r = Arc::clone(&resets);
        breaker.on_event("reset-counter", move |event| {
            if matches!(event, BreakerEvent::Reset) {
                r.fetch_add(1, Ordering::SeqCst);
            }
        });

        breaker.record_loss(Decimal::new(-200_000, 0));
        breaker.reset();
        assert_eq!(trips.load(Ordering::SeqCst), 1);
        assert_eq!(resets.load(Ordering::SeqCst), 1);

        assert!(breaker.remove_callback("trip-counter"));
        breaker.record_loss(Decimal::new(-200_000, 0));
        assert_eq!(trips.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_query_breaker() {
        let breaker = Arc::new(CircuitBreaker::new(config()));
        let observed = Arc::new(Mutex::new(None));

        let b = Arc::downgrade(&breaker);
        let o = Arc::clone(&observed);
        breaker.on_event("inspector", move |_| {
            if let Some(b) = b.upgrade() {
                *o.lock().unwrap() = Some(b.state().state);
            }
        });

        breaker.activate_kill_switch("inspect");
        assert_eq!(*observed.lock().unwrap(), Some(CircuitState::Open));
    }

    #[test]
    fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breaker.json");

        {
            let breaker = CircuitBreaker::with_persistence(config(), &path);
            breaker.record_loss(Decimal::new(-150_000, 0));
            assert!(breaker.is_open());
        }

        let reopened = CircuitBreaker::with_persistence(config(), &path);
        let state = reopened.state();
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.trigger_type, Some(TriggerType::HardBudgetLimit));
        assert!(!reopened.can_execute().is_allowed());
    }

    #[test]
    fn test_timeout_uses_persisted_trip_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breaker.json");

        {
            let breaker = CircuitBreaker::with_persistence(config(), &path);
            breaker.record_loss(Decimal::new(-150_000, 0));
        }

        // Pretend the process was down for two hours
        let store = JsonStateStore::new(&path);
        let mut state = store.load().unwrap().unwrap();
        state.triggered_at = Some(Utc::now() - Duration::hours(2));
        store.save(&state).unwrap();

        let reopened = CircuitBreaker::with_persistence(config(), &path);
        assert!(reopened.can_execute().is_allowed());
        assert_eq!(reopened.state().state, CircuitState::HalfOpen);

        // The transition itself was persisted
        let on_disk = store.load().unwrap().unwrap();
        assert_eq!(on_disk.state, CircuitState::HalfOpen);
    }

    #[test]
    fn test_auto_reset_hours() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breaker.json");
        let cfg = CircuitBreakerConfig {
            auto_reset_hours: Some(24),
            manual_reset_required: true,
            ..config()
        };

        {
            let breaker = CircuitBreaker::with_persistence(cfg.clone(), &path);
            breaker.record_loss(Decimal::new(-150_000, 0));
        }
        let store = JsonStateStore::new(&path);
        let mut state = store.load().unwrap().unwrap();
        state.triggered_at = Some(Utc::now() - Duration::hours(25));
        store.save(&state).unwrap();

        let reopened = CircuitBreaker::with_persistence(cfg, &path);
        assert!(reopened.can_execute().is_allowed());
        let state = reopened.state();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.total_losses, Decimal::ZERO);
    }

    #[test]
    fn test_corrupt_state_file_starts_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breaker.json");
        std::fs::write(&path, "not json").unwrap();

        let breaker = CircuitBreaker::with_persistence(config(), &path);
        assert_eq!(breaker.state().state, CircuitState::Closed);
        assert!(breaker.can_execute().is_allowed());
    }

    #[test]
    fn test_kill_switch_from_another_instance_halts_running_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breaker.json");
        let running = CircuitBreaker::with_persistence(config(), &path);
        assert!(running.can_execute().is_allowed());

        let admin = CircuitBreaker::with_persistence(config(), &path);
        admin.activate_kill_switch("admin halt");

        let permit = running.can_execute();
        assert!(!permit.is_allowed());
        assert!(permit.reason.contains("admin halt"));

        // A health check in the running instance must not erase the override
        running.check_portfolio_health(Decimal::new(100_000, 0), Decimal::new(100_000, 0));
        let on_disk = JsonStateStore::new(&path).load().unwrap().unwrap();
        assert!(on_disk.kill_switch_active);
        assert_eq!(on_disk.state, CircuitState::Open);
        assert_eq!(
            on_disk.metadata.get("last_portfolio_value"),
            Some(&serde_json::Value::String("100000".to_string()))
        );
        assert!(!running.reset());

        assert!(admin.deactivate_kill_switch());
        assert!(running.can_execute().is_allowed());
        assert!(!running.state().kill_switch_active);
    }

    #[test]
    fn test_losses_from_both_instances_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breaker.json");
        let first = CircuitBreaker::with_persistence(config(), &path);
        let second = CircuitBreaker::with_persistence(config(), &path);

        first.record_loss(Decimal::new(-60_000, 0));
        let trigger = second.record_loss(Decimal::new(-60_000, 0));
        assert_eq!(trigger, Some(TriggerType::HardBudgetLimit));
        assert!(first.is_open());
        assert_eq!(first.state().total_losses, Decimal::new(-120_000, 0));
    }

    #[test]
    fn test_unrepresentable_timeout_stays_open() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_timeout_secs: i64::MAX,
            ..config()
        });
        breaker.record_loss(Decimal::new(-1_000_000, 0));

        let permit = breaker.can_execute();
        assert!(!permit.is_allowed());
        assert_eq!(breaker.state().state, CircuitState::Open);
    }

    #[test]
    fn test_unrepresentable_auto_reset_never_fires() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            auto_reset_hours: Some(i64::MAX),
            manual_reset_required: true,
            ..config()
        });
        breaker.record_loss(Decimal::new(-1_000_000, 0));

        assert!(!breaker.can_execute().is_allowed());
        assert_eq!(breaker.state().state, CircuitState::Open);
    }

    #[test]
    fn test_persisted_json_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breaker.json");
        let breaker = CircuitBreaker::with_persistence(config(), &path);
        breaker.activate_kill_switch("shape check");

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["state"], "OPEN");
        assert_eq!(raw["trigger_type"], "EMERGENCY_KILL_SWITCH");
        assert_eq!(raw["kill_switch_active"], true);
        for key in [
            "trigger_reason",
            "triggered_at",
            "failure_count",
            "last_failure_at",
            "success_count_in_half_open",
            "total_losses",
            "peak_loss",
            "manual_reset_required",
            "reset_at",
            "metadata",
        ] {
            assert!(raw.get(key).is_some(), "missing {}", key);
        }
    }

    #[test]
    fn test_concurrent_losses_are_serialized() {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            hard_budget_limit: Decimal::new(-1_000_000_000, 0),
            daily_loss_limit: Decimal::new(-1_000_000_000, 0),
            ..config()
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&breaker);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        b.record_loss(Decimal::new(-1, 0));
                        b.can_execute();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let state = breaker.state();
        assert_eq!(state.total_losses, Decimal::new(-800, 0));
        assert_eq!(state.failure_count, 800);
    }
}
