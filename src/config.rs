//! Bus-wide configuration and the builder that assembles a [`Bus`] from it,
//! following this crate's builder-with-validation style
//! (`RetryPolicyBuilder`/`ResilienceStackBuilder` in the original resilience
//! stack this bus replaces).

use std::sync::Arc;
use std::time::Duration;

use crate::bus::Bus;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::clock::{Clock, MonotonicClock};
use crate::error::BusError;
use crate::queue::BackpressureStrategy;
use crate::retry::RetryConfig;
use crate::scheduled::{NullScheduledEventStore, ScheduledEventStore};
use crate::sink::{NullSink, ObservabilitySink};
use crate::sleeper::{Sleeper, TokioSleeper};

/// Every numeric/behavioral default the dispatch core needs, gathered in one
/// place so a caller can override a handful of fields via `..Default::default()`.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub queue_maxsize: usize,
    pub queue_low_water: f64,
    pub queue_high_water: f64,
    pub queue_strategy: BackpressureStrategy,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub dead_letter_capacity: usize,
    pub error_suppression: bool,
    pub shutdown_grace: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_maxsize: 10_000,
            queue_low_water: 0.5,
            queue_high_water: 0.8,
            queue_strategy: BackpressureStrategy::DropOldest,
            batch_size: 10,
            batch_timeout: Duration::from_millis(10),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            dead_letter_capacity: 1_000,
            error_suppression: true,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<(), BusError> {
        if !(0.0 < self.queue_low_water && self.queue_low_water < self.queue_high_water && self.queue_high_water <= 1.0)
        {
            return Err(BusError::InvalidWatermarks { low: self.queue_low_water, high: self.queue_high_water });
        }
        self.circuit_breaker.validate()?;
        Ok(())
    }
}

/// Assembles a [`Bus`] from a [`BusConfig`] plus optional external
/// collaborators (observability sink, scheduled-event store, clock, sleeper).
/// Every collaborator defaults to a no-op/production implementation, so
/// `BusBuilder::new().build()` always produces a usable bus.
pub struct BusBuilder {
    config: BusConfig,
    sink: Option<Arc<dyn ObservabilitySink>>,
    scheduled_store: Option<Arc<dyn ScheduledEventStore>>,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Option<Arc<dyn Sleeper>>,
}

impl BusBuilder {
    pub fn new() -> Self {
        Self { config: BusConfig::default(), sink: None, scheduled_store: None, clock: None, sleeper: None }
    }

    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn observability_sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn scheduled_event_store(mut self, store: Arc<dyn ScheduledEventStore>) -> Self {
        self.scheduled_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    pub fn build(self) -> Result<Bus, BusError> {
        self.config.validate()?;
        Bus::new(
            self.config,
            self.sink.unwrap_or_else(|| Arc::new(NullSink)),
            self.scheduled_store.unwrap_or_else(|| Arc::new(NullScheduledEventStore)),
            self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default())),
            self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper)),
        )
    }
}

impl Default for BusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_builder_produces_a_bus() {
        let bus = BusBuilder::new().build();
        assert!(bus.is_ok());
    }

    #[test]
    fn invalid_watermarks_are_rejected_at_build_time() {
        let config = BusConfig { queue_low_water: 0.9, queue_high_water: 0.5, ..BusConfig::default() };
        let err = BusBuilder::new().config(config).build().unwrap_err();
        assert!(matches!(err, BusError::InvalidWatermarks { .. }));
    }
}
