//! Per-command-type circuit breaker with a sliding failure window (C5).
//!
//! Unlike this crate's earlier generic breaker (one instance per protected
//! call site), the bus needs one breaker *per command type*, looked up by
//! `TypeId` from the registry's own dispatch path. [`CircuitBreakerRegistry`]
//! owns that keyed map; each breaker entry is independently locked.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::{Clock, MonotonicClock};
use crate::error::BusError;
use crate::metrics::{names, MetricsCollector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Numeric label for the `circuit_breaker_state` gauge (§6).
    pub fn as_gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub window_size: Duration,
    pub recovery_timeout: Duration,
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_size: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), BusError> {
        if self.failure_threshold == 0 {
            return Err(BusError::InvalidCircuitBreakerConfig("failure_threshold must be >= 1"));
        }
        if self.success_threshold == 0 {
            return Err(BusError::InvalidCircuitBreakerConfig("success_threshold must be >= 1"));
        }
        Ok(())
    }
}

/// Rejection reason returned instead of invoking the handler.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitOpenError {
    pub command_type: &'static str,
    pub opened_at: DateTime<Utc>,
}

struct Inner {
    state: CircuitState,
    /// Timestamps of recent failures, oldest first; pruned to `window_size` on each push.
    failures: Vec<DateTime<Utc>>,
    success_count: usize,
    last_state_change: DateTime<Utc>,
    /// `clock.now_millis()` reading taken at the moment the breaker opened;
    /// the wall-clock `last_state_change` above drives the sliding failure
    /// window, this clock-relative tick drives the `recovery_timeout` check
    /// so tests can fast-forward it with an injected [`Clock`].
    opened_at_ticks: u64,
}

/// One breaker instance for a single command type.
struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<Inner>,
}

impl CircuitBreaker {
    fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: Vec::new(),
                success_count: 0,
                last_state_change: Utc::now(),
                opened_at_ticks: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Evaluate whether a call may proceed right now, performing the
    /// `OPEN -> HALF_OPEN` transition if the recovery timeout has elapsed.
    fn gate(&self, command_type: &'static str) -> Result<(), CircuitOpenError> {
        let mut guard = self.lock();
        match guard.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed_ms = self.clock.now_millis().saturating_sub(guard.opened_at_ticks);
                if elapsed_ms >= self.config.recovery_timeout.as_millis() as u64 {
                    guard.state = CircuitState::HalfOpen;
                    guard.success_count = 0;
                    guard.last_state_change = Utc::now();
                    tracing::info!(command_type, "circuit breaker -> half_open");
                    Ok(())
                } else {
                    Err(CircuitOpenError { command_type, opened_at: guard.last_state_change })
                }
            }
        }
    }

    fn on_success(&self, command_type: &'static str) {
        let mut guard = self.lock();
        match guard.state {
            CircuitState::HalfOpen => {
                guard.success_count += 1;
                if guard.success_count >= self.config.success_threshold {
                    guard.state = CircuitState::Closed;
                    guard.failures.clear();
                    guard.success_count = 0;
                    guard.last_state_change = Utc::now();
                    tracing::info!(command_type, "circuit breaker -> closed");
                }
            }
            CircuitState::Closed => {
                guard.failures.clear();
            }
            CircuitState::Open => {}
        }
    }

    /// Returns `true` if this failure tripped the breaker open.
    fn on_failure(&self, command_type: &'static str) -> bool {
        let mut guard = self.lock();
        match guard.state {
            CircuitState::HalfOpen => {
                guard.state = CircuitState::Open;
                guard.success_count = 0;
                guard.failures.clear();
                guard.last_state_change = Utc::now();
                guard.opened_at_ticks = self.clock.now_millis();
                tracing::warn!(command_type, "circuit breaker -> open (failed during half_open)");
                true
            }
            CircuitState::Closed => {
                let now = Utc::now();
                guard.failures.push(now);
                let window = self.config.window_size;
                guard.failures.retain(|t| {
                    now.signed_duration_since(*t).to_std().unwrap_or(Duration::ZERO) <= window
                });
                if guard.failures.len() >= self.config.failure_threshold {
                    guard.state = CircuitState::Open;
                    guard.last_state_change = now;
                    guard.opened_at_ticks = self.clock.now_millis();
                    tracing::warn!(command_type, failures = guard.failures.len(), "circuit breaker -> open");
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => false,
        }
    }

    fn current_state(&self) -> CircuitState {
        self.lock().state
    }

    fn reset(&self) {
        let mut guard = self.lock();
        guard.state = CircuitState::Closed;
        guard.failures.clear();
        guard.success_count = 0;
        guard.last_state_change = Utc::now();
        guard.opened_at_ticks = 0;
    }
}

/// Keyed collection of per-command-type breakers, built around a single
/// shared clock so all breakers in a bus instance agree on elapsed time.
pub struct CircuitBreakerRegistry {
    clock: Arc<dyn Clock>,
    breakers: Mutex<HashMap<TypeId, (&'static str, Arc<CircuitBreaker>)>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self::with_clock(default_config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(default_config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self { clock, breakers: Mutex::new(HashMap::new()), default_config }
    }

    fn entry(&self, type_id: TypeId, command_type: &'static str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(type_id)
            .or_insert_with(|| {
                (command_type, Arc::new(CircuitBreaker::new(self.default_config.clone(), self.clock.clone())))
            })
            .1
            .clone()
    }

    /// Gate an invocation for command type `C`. On success of the caller's
    /// operation, call [`Self::report_success`]; on failure, [`Self::report_failure`].
    pub fn gate<C: 'static>(&self, command_type: &'static str) -> Result<(), CircuitOpenError> {
        self.entry(TypeId::of::<C>(), command_type).gate(command_type)
    }

    pub fn report_success<C: 'static>(&self, command_type: &'static str) {
        self.entry(TypeId::of::<C>(), command_type).on_success(command_type);
    }

    /// Returns `true` if this failure tripped the breaker open (used to stop the retry loop early).
    pub fn report_failure<C: 'static>(&self, command_type: &'static str) -> bool {
        self.entry(TypeId::of::<C>(), command_type).on_failure(command_type)
    }

    pub fn state<C: 'static>(&self) -> CircuitState {
        let breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers.get(&TypeId::of::<C>()).map(|(_, b)| b.current_state()).unwrap_or(CircuitState::Closed)
    }

    pub fn reset_all(&self) {
        let breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        for (_, b) in breakers.values() {
            b.reset();
        }
    }

    /// Every command type with a breaker instantiated so far, paired with its
    /// current state. A type with no failures yet never appears here (it's
    /// implicitly `Closed`) — surfaced through `Bus::get_circuit_breaker_states`.
    pub fn states(&self) -> Vec<(&'static str, CircuitState)> {
        let breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers.values().map(|(name, b)| (*name, b.current_state())).collect()
    }

    /// Publish every tracked breaker's state into the `circuit_breaker_state`
    /// gauge. The gauge itself carries no per-type label dimension in this
    /// in-process collector, so this reports the single worst (most-open)
    /// state observed, sufficient for the bus-wide health read in `get_stats`.
    pub fn record_metrics(&self, metrics: &MetricsCollector) {
        let breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        let worst =
            breakers.values().map(|(_, b)| b.current_state().as_gauge_value()).fold(0.0_f64, f64::max);
        metrics.set_gauge(names::CIRCUIT_BREAKER_STATE, worst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    struct Add;
    struct Sub;

    #[test]
    fn opens_after_failure_threshold_within_window() {
        let clock = Arc::new(FakeClock::new());
        let registry = CircuitBreakerRegistry::with_clock(
            CircuitBreakerConfig { failure_threshold: 3, window_size: Duration::from_secs(60), ..Default::default() },
            clock,
        );
        assert!(registry.gate::<Add>("Add").is_ok());
        assert!(!registry.report_failure::<Add>("Add"));
        assert!(!registry.report_failure::<Add>("Add"));
        assert!(registry.report_failure::<Add>("Add"));
        assert_eq!(registry.state::<Add>(), CircuitState::Open);
        assert!(registry.gate::<Add>("Add").is_err());
    }

    #[test]
    fn breakers_are_independent_per_command_type() {
        let clock = Arc::new(FakeClock::new());
        let registry = CircuitBreakerRegistry::with_clock(
            CircuitBreakerConfig { failure_threshold: 1, ..Default::default() },
            clock,
        );
        registry.report_failure::<Add>("Add");
        assert_eq!(registry.state::<Add>(), CircuitState::Open);
        assert_eq!(registry.state::<Sub>(), CircuitState::Closed);
    }

    #[test]
    fn half_open_after_recovery_timeout_then_closes_on_success() {
        let clock = Arc::new(FakeClock::new());
        let registry = CircuitBreakerRegistry::with_clock(
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_millis(100),
                success_threshold: 1,
                ..Default::default()
            },
            clock.clone(),
        );
        registry.report_failure::<Add>("Add");
        assert_eq!(registry.state::<Add>(), CircuitState::Open);
        assert!(registry.gate::<Add>("Add").is_err());

        clock.advance(Duration::from_millis(150));
        assert!(registry.gate::<Add>("Add").is_ok());
        assert_eq!(registry.state::<Add>(), CircuitState::HalfOpen);
        registry.report_success::<Add>("Add");
        assert_eq!(registry.state::<Add>(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_returns_to_open() {
        let clock = Arc::new(FakeClock::new());
        let registry = CircuitBreakerRegistry::with_clock(
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_millis(10),
                success_threshold: 2,
                ..Default::default()
            },
            clock.clone(),
        );
        registry.report_failure::<Add>("Add");
        clock.advance(Duration::from_millis(20));
        assert!(registry.gate::<Add>("Add").is_ok());
        assert_eq!(registry.state::<Add>(), CircuitState::HalfOpen);
        registry.report_failure::<Add>("Add");
        assert_eq!(registry.state::<Add>(), CircuitState::Open);
    }
}
