//! Loss-triggered trading halt with a drain protocol: an explicit CLOSED/DRAINING/OPEN/HALF_OPEN
//! state machine, persisted to a JSON file after every transition via `get_state`/restore-on-load
//! round-tripping.

use crate::{
    event_bus::{EventBus, Topic},
    money::Currency,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    #[error("denied: {0}")]
    Denied(DenyReason),
    #[error("reset() is only legal from OPEN, currently {0:?}")]
    NotOpen(State),
    #[error("cooldown has not elapsed since breaker opened at {0}")]
    CooldownNotElapsed(DateTime<Utc>),
    #[error("io error persisting circuit breaker state: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Encode(String),
}

impl From<std::io::Error> for CircuitBreakerError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum DenyReason {
    CircuitBreaker,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "circuit_breaker")
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum State {
    Closed,
    Draining,
    Open,
    HalfOpen,
}

/// Persisted circuit breaker state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: State,
    pub peak_value: Decimal,
    pub current_value: Decimal,
    pub in_flight_order_ids: BTreeSet<SmolStr>,
    pub opened_at: Option<DateTime<Utc>>,
    pub consecutive_reconcile_failures: u32,
    /// Order id of the outstanding HALF_OPEN probe, if one has been registered.
    pub probe_order_id: Option<SmolStr>,
}

impl CircuitBreakerState {
    fn new(starting_peak: Decimal) -> Self {
        Self {
            state: State::Closed,
            peak_value: starting_peak,
            current_value: starting_peak,
            in_flight_order_ids: BTreeSet::new(),
            opened_at: None,
            consecutive_reconcile_failures: 0,
            probe_order_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub loss_threshold: Decimal,
    pub reconcile_fail_limit: u32,
    pub drain_deadline: std::time::Duration,
    pub cooldown: chrono::Duration,
}

/// The sole writer of circuit breaker state. Persisted to `state_path` after every transition.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state_path: PathBuf,
    state: parking_lot::Mutex<CircuitBreakerState>,
    drained: tokio::sync::Notify,
    events: EventBus,
}

impl CircuitBreaker {
    /// Load persisted state from `state_path` if present, otherwise start CLOSED at
    /// `starting_peak`. A persisted OPEN or DRAINING state remains OPEN until an
    /// operator-initiated [`Self::reset`] (DRAINING is conservatively treated as OPEN on reload
    /// since no in-flight orders survive a process restart to drain).
    pub fn load_or_new(
        state_path: impl Into<PathBuf>,
        starting_peak: Decimal,
        config: CircuitBreakerConfig,
        events: EventBus,
    ) -> Result<Self, CircuitBreakerError> {
        let state_path = state_path.into();
        let mut state = Self::read_state(&state_path)?.unwrap_or_else(|| CircuitBreakerState::new(starting_peak));

        if matches!(state.state, State::Draining) {
            state.state = State::Open;
            state.opened_at.get_or_insert(Utc::now());
            state.in_flight_order_ids.clear();
        }

        let breaker = Self {
            config,
            state_path,
            state: parking_lot::Mutex::new(state),
            drained: tokio::sync::Notify::new(),
            events,
        };
        breaker.persist()?;
        Ok(breaker)
    }

    fn read_state(path: &Path) -> Result<Option<CircuitBreakerState>, CircuitBreakerError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let state = serde_json::from_str(&contents)
                    .map_err(|e| CircuitBreakerError::Encode(e.to_string()))?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self) -> Result<(), CircuitBreakerError> {
        let state = self.state.lock();
        if let Some(parent) = self.state_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&*state)
            .map_err(|e| CircuitBreakerError::Encode(e.to_string()))?;
        std::fs::write(&self.state_path, json)?;
        Ok(())
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        self.state.lock().clone()
    }

    /// Update `peak_value`, evaluate the CLOSED→DRAINING loss trigger, and deny whenever the
    /// gateway must not accept new orders.
    pub fn check(&self, current_value: Decimal) -> Result<(), CircuitBreakerError> {
        let mut state = self.state.lock();
        state.peak_value = state.peak_value.max(current_value);
        state.current_value = current_value;

        if state.state == State::Closed {
            let floor = state.peak_value * (Decimal::ONE - self.config.loss_threshold);
            if current_value < floor {
                state.state = State::Draining;
                state.opened_at = Some(Utc::now());
                drop(state);
                self.persist()?;
                self.events.publish(
                    Topic::RiskCircuitBreaker,
                    &serde_json::json!({"transition": "closed_to_draining"}),
                );
                return Err(CircuitBreakerError::Denied(DenyReason::CircuitBreaker));
            }
        }

        let deny = match state.state {
            State::Closed => false,
            State::Draining | State::Open => true,
            State::HalfOpen => state.probe_order_id.is_some(),
        };

        if deny {
            Err(CircuitBreakerError::Denied(DenyReason::CircuitBreaker))
        } else {
            Ok(())
        }
    }

    /// Register an order as in-flight. While HALF_OPEN, the first registered order becomes the
    /// probe; subsequent registrations are refused by `check` before they reach here.
    pub fn register(&self, order_id: &str) -> Result<(), CircuitBreakerError> {
        let mut state = self.state.lock();
        state.in_flight_order_ids.insert(SmolStr::new(order_id));
        if state.state == State::HalfOpen && state.probe_order_id.is_none() {
            state.probe_order_id = Some(SmolStr::new(order_id));
        }
        drop(state);
        self.persist()
    }

    /// Mark an in-flight order complete. `success` only matters while HALF_OPEN and only for the
    /// probe order.
    pub fn complete(&self, order_id: &str, success: bool) -> Result<(), CircuitBreakerError> {
        let mut state = self.state.lock();
        state.in_flight_order_ids.remove(order_id);

        match state.state {
            State::Draining if state.in_flight_order_ids.is_empty() => {
                state.state = State::Open;
                state.opened_at = Some(Utc::now());
                drop(state);
                self.persist()?;
                self.drained.notify_waiters();
                self.events.publish(
                    Topic::RiskCircuitBreaker,
                    &serde_json::json!({"transition": "draining_to_open"}),
                );
                return Ok(());
            }
            State::HalfOpen if state.probe_order_id.as_deref() == Some(order_id) => {
                if success {
                    state.state = State::Closed;
                    state.opened_at = None;
                    state.consecutive_reconcile_failures = 0;
                } else {
                    state.state = State::Open;
                    state.opened_at = Some(Utc::now());
                }
                state.probe_order_id = None;
                drop(state);
                self.persist()?;
                return Ok(());
            }
            _ => {}
        }
        drop(state);
        self.persist()
    }

    /// Block until `in_flight_order_ids` drains to empty or `deadline` elapses.
    pub async fn wait_for_drain(&self, deadline: std::time::Duration) -> Result<bool, CircuitBreakerError> {
        if self.state.lock().in_flight_order_ids.is_empty() {
            return Ok(true);
        }
        match tokio::time::timeout(deadline, self.drained.notified()).await {
            Ok(()) => Ok(true),
            Err(_) => Ok(self.state.lock().in_flight_order_ids.is_empty()),
        }
    }

    /// Record the outcome of one reconciliation cycle. On failure, increments
    /// `consecutive_reconcile_failures` and trips straight to OPEN once `reconcile_fail_limit` is
    /// reached.
    pub fn record_reconcile_result(&self, ok: bool) -> Result<(), CircuitBreakerError> {
        let mut state = self.state.lock();
        if ok {
            state.consecutive_reconcile_failures = 0;
            drop(state);
            return self.persist();
        }

        state.consecutive_reconcile_failures += 1;
        if state.consecutive_reconcile_failures >= self.config.reconcile_fail_limit {
            state.state = State::Open;
            state.opened_at = Some(Utc::now());
        }
        drop(state);
        self.persist()
    }

    /// Force an immediate transition to OPEN, bypassing DRAINING. Used by the reconciler when a
    /// mismatch is severe enough that draining in-flight orders is not safe.
    pub fn trip(&self, _reason: impl Into<String>) -> Result<(), CircuitBreakerError> {
        let mut state = self.state.lock();
        state.state = State::Open;
        state.opened_at = Some(Utc::now());
        state.in_flight_order_ids.clear();
        drop(state);
        self.persist()
    }

    /// Only legal from OPEN, and only once `cooldown` has elapsed since `opened_at`. Persists a
    /// reset record before transitioning to HALF_OPEN. Reconciliation-passed confirmation is the
    /// caller's responsibility (the operator CLI's `pre-trading-check`).
    pub fn reset(&self) -> Result<(), CircuitBreakerError> {
        let mut state = self.state.lock();
        if state.state != State::Open {
            return Err(CircuitBreakerError::NotOpen(state.state));
        }
        let opened_at = state.opened_at.unwrap_or_else(Utc::now);
        if Utc::now() - opened_at < self.config.cooldown {
            return Err(CircuitBreakerError::CooldownNotElapsed(opened_at));
        }
        state.state = State::HalfOpen;
        state.probe_order_id = None;
        drop(state);
        self.persist()
    }

    pub fn is_trading_allowed(&self) -> bool {
        matches!(self.state.lock().state, State::Closed | State::HalfOpen)
    }
}

/// Convenience alias used by call sites that need a reference-value argument for `check`, e.g.
/// total portfolio value denominated in a single reference currency.
pub type PortfolioCurrency = Currency;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn breaker(peak: Decimal, path: &Path) -> CircuitBreaker {
        CircuitBreaker::load_or_new(
            path,
            peak,
            CircuitBreakerConfig {
                loss_threshold: dec!(0.10),
                reconcile_fail_limit: 3,
                drain_deadline: std::time::Duration::from_secs(5),
                cooldown: chrono::Duration::seconds(0),
            },
            EventBus::new(Default::default()),
        )
        .unwrap()
    }

    fn temp_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gateway_cb_test_{label}_{}.json", std::process::id()))
    }

    #[test]
    fn drain_then_open_then_persists_across_restart() {
        let path = temp_path("drain");
        let _ = std::fs::remove_file(&path);
        let cb = breaker(dec!(10000), &path);

        cb.check(dec!(10000)).unwrap();
        cb.register("order-1").unwrap();

        // Portfolio drops below the 10% loss threshold: CLOSED -> DRAINING, deny new orders.
        let err = cb.check(dec!(8900)).unwrap_err();
        assert!(matches!(err, CircuitBreakerError::Denied(_)));
        assert_eq!(cb.snapshot().state, State::Draining);

        // In-flight order runs to terminal: DRAINING -> OPEN.
        cb.complete("order-1", true).unwrap();
        assert_eq!(cb.snapshot().state, State::Open);

        // Restart: breaker remains OPEN.
        let reloaded = breaker(dec!(10000), &path);
        assert_eq!(reloaded.snapshot().state, State::Open);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn half_open_probe_failure_returns_to_open() {
        let path = temp_path("probe_fail");
        let _ = std::fs::remove_file(&path);
        let cb = breaker(dec!(10000), &path);
        cb.trip("manual").unwrap();
        cb.reset().unwrap();
        assert_eq!(cb.snapshot().state, State::HalfOpen);

        cb.register("probe-1").unwrap();
        assert!(cb.check(dec!(10000)).is_err());

        cb.complete("probe-1", false).unwrap();
        assert_eq!(cb.snapshot().state, State::Open);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn half_open_probe_success_closes() {
        let path = temp_path("probe_ok");
        let _ = std::fs::remove_file(&path);
        let cb = breaker(dec!(10000), &path);
        cb.trip("manual").unwrap();
        cb.reset().unwrap();

        cb.register("probe-1").unwrap();
        cb.complete("probe-1", true).unwrap();
        assert_eq!(cb.snapshot().state, State::Closed);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn reconcile_failures_trip_breaker_at_limit() {
        let path = temp_path("reconcile");
        let _ = std::fs::remove_file(&path);
        let cb = breaker(dec!(10000), &path);

        cb.record_reconcile_result(false).unwrap();
        cb.record_reconcile_result(false).unwrap();
        assert_eq!(cb.snapshot().state, State::Closed);
        cb.record_reconcile_result(false).unwrap();
        assert_eq!(cb.snapshot().state, State::Open);
        let _ = std::fs::remove_file(&path);
    }
}
