//! Counters, histograms, and gauges for monitoring bus operations (C1).
//!
//! A single [`MetricsCollector`] pre-registers the canonical metric names
//! this crate's dispatch core reports against; handlers and external
//! collaborators never construct their own `Counter`/`Histogram`/`Gauge`.

use std::collections::HashMap;
use std::sync::Mutex;

/// Default bucket schedule, in milliseconds, used by the processing-duration histograms.
pub const DEFAULT_BUCKETS_MS: &[f64] =
    &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0];

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: f64,
}

impl Counter {
    /// Increment by `delta`. `delta` must be non-negative; this is a
    /// programmer error, not a runtime condition, so it panics.
    pub fn inc(&mut self, delta: f64) {
        assert!(delta >= 0.0, "counter increment must be non-negative, got {delta}");
        self.value += delta;
    }

    pub fn get(&self) -> f64 {
        self.value
    }
}

/// A histogram of real-valued observations with percentile and bucket reads.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    values: Vec<f64>,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        Self { buckets, values: Vec::new() }
    }

    pub fn with_default_buckets() -> Self {
        Self::new(DEFAULT_BUCKETS_MS.to_vec())
    }

    pub fn observe(&mut self, value: f64) {
        self.values.push(value);
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn sum(&self) -> f64 {
        self.values.iter().sum()
    }

    /// Percentile `p` in `[0, 100]` over the sample, using linear
    /// interpolation at position `(n-1) * p / 100`. `None` on an empty
    /// histogram. Panics if `p` is out of range — an invalid percentile
    /// request is a programmer error, per this crate's metrics failure policy.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        assert!((0.0..=100.0).contains(&p), "percentile must be in [0, 100], got {p}");
        if self.values.is_empty() {
            return None;
        }
        let mut sorted = self.values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("histogram values must not be NaN"));

        let n = sorted.len();
        if n == 1 {
            return Some(sorted[0]);
        }

        let pos = (n - 1) as f64 * p / 100.0;
        let lower = pos.floor() as usize;
        let upper = (lower + 1).min(n - 1);
        if lower == upper {
            return Some(sorted[lower]);
        }
        let fraction = pos - lower as f64;
        Some(sorted[lower] + fraction * (sorted[upper] - sorted[lower]))
    }

    /// Count of observations falling into each configured bucket (inclusive
    /// upper bound), plus an implicit `+Inf` bucket for anything above the
    /// largest configured bound.
    pub fn bucket_counts(&self) -> HashMap<String, usize> {
        let mut counts: HashMap<String, usize> =
            self.buckets.iter().map(|b| (format!("{b}"), 0)).collect();
        counts.insert("+Inf".to_string(), 0);

        for value in &self.values {
            match self.buckets.iter().find(|&&b| *value <= b) {
                Some(b) => *counts.get_mut(&format!("{b}")).unwrap() += 1,
                None => *counts.get_mut("+Inf").unwrap() += 1,
            }
        }
        counts
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::with_default_buckets()
    }
}

/// A gauge that can move up and down.
#[derive(Debug, Default)]
pub struct Gauge {
    value: f64,
}

impl Gauge {
    pub fn set(&mut self, value: f64) {
        self.value = value;
    }

    pub fn inc(&mut self, delta: f64) {
        self.value += delta;
    }

    pub fn dec(&mut self, delta: f64) {
        self.value -= delta;
    }

    pub fn get(&self) -> f64 {
        self.value
    }
}

/// Canonical metric names the bus reports against (§6).
pub mod names {
    pub const EVENTS_PUBLISHED_TOTAL: &str = "events_published_total";
    pub const EVENTS_PROCESSED_TOTAL: &str = "events_processed_total";
    pub const EVENTS_FAILED_TOTAL: &str = "events_failed_total";
    pub const COMMANDS_SENT_TOTAL: &str = "commands_sent_total";
    pub const COMMANDS_PROCESSED_TOTAL: &str = "commands_processed_total";
    pub const COMMANDS_FAILED_TOTAL: &str = "commands_failed_total";

    pub const EVENT_PROCESSING_DURATION_SECONDS: &str = "event_processing_duration_seconds";
    pub const COMMAND_PROCESSING_DURATION_SECONDS: &str = "command_processing_duration_seconds";

    pub const QUEUE_SIZE: &str = "queue_size";
    pub const BACKPRESSURE_ACTIVE: &str = "backpressure_active";
    pub const CIRCUIT_BREAKER_STATE: &str = "circuit_breaker_state";
    pub const DEAD_LETTER_QUEUE_SIZE: &str = "dead_letter_queue_size";
    pub const ACTIVE_SESSIONS: &str = "active_sessions";
    pub const REGISTERED_HANDLERS: &str = "registered_handlers";
}

#[derive(Debug, Default)]
struct Registry {
    counters: HashMap<String, Counter>,
    histograms: HashMap<String, Histogram>,
    gauges: HashMap<String, Gauge>,
}

/// Centralised metrics storage for one bus instance. Pre-registers the
/// canonical names in [`names`] so the dispatch core can increment/observe
/// them unconditionally without a prior registration step.
#[derive(Debug)]
pub struct MetricsCollector {
    inner: Mutex<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        for name in [
            names::EVENTS_PUBLISHED_TOTAL,
            names::EVENTS_PROCESSED_TOTAL,
            names::EVENTS_FAILED_TOTAL,
            names::COMMANDS_SENT_TOTAL,
            names::COMMANDS_PROCESSED_TOTAL,
            names::COMMANDS_FAILED_TOTAL,
        ] {
            registry.counters.insert(name.to_string(), Counter::default());
        }
        for name in
            [names::EVENT_PROCESSING_DURATION_SECONDS, names::COMMAND_PROCESSING_DURATION_SECONDS]
        {
            registry.histograms.insert(name.to_string(), Histogram::with_default_buckets());
        }
        for name in [
            names::QUEUE_SIZE,
            names::BACKPRESSURE_ACTIVE,
            names::CIRCUIT_BREAKER_STATE,
            names::DEAD_LETTER_QUEUE_SIZE,
            names::ACTIVE_SESSIONS,
            names::REGISTERED_HANDLERS,
        ] {
            registry.gauges.insert(name.to_string(), Gauge::default());
        }
        Self { inner: Mutex::new(registry) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn inc_counter(&self, name: &str, delta: f64) {
        if let Some(counter) = self.lock().counters.get_mut(name) {
            counter.inc(delta);
        }
    }

    pub fn counter_value(&self, name: &str) -> Option<f64> {
        self.lock().counters.get(name).map(Counter::get)
    }

    pub fn observe_histogram(&self, name: &str, value: f64) {
        if let Some(hist) = self.lock().histograms.get_mut(name) {
            hist.observe(value);
        }
    }

    pub fn histogram_percentile(&self, name: &str, p: f64) -> Option<f64> {
        self.lock().histograms.get(name).and_then(|h| h.percentile(p))
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        if let Some(gauge) = self.lock().gauges.get_mut(name) {
            gauge.set(value);
        }
    }

    pub fn inc_gauge(&self, name: &str, delta: f64) {
        if let Some(gauge) = self.lock().gauges.get_mut(name) {
            gauge.inc(delta);
        }
    }

    pub fn dec_gauge(&self, name: &str, delta: f64) {
        if let Some(gauge) = self.lock().gauges.get_mut(name) {
            gauge.dec(delta);
        }
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.lock().gauges.get(name).map(Gauge::get)
    }

    /// Reset every registered metric to its zero value, keeping registration.
    pub fn reset(&self) {
        let mut registry = self.lock();
        for counter in registry.counters.values_mut() {
            counter.value = 0.0;
        }
        for hist in registry.histograms.values_mut() {
            hist.clear();
        }
        for gauge in registry.gauges.values_mut() {
            gauge.value = 0.0;
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let mut c = Counter::default();
        c.inc(1.0);
        c.inc(2.5);
        assert_eq!(c.get(), 3.5);
    }

    #[test]
    #[should_panic]
    fn counter_rejects_negative_increment() {
        let mut c = Counter::default();
        c.inc(-1.0);
    }

    #[test]
    fn percentile_zero_and_hundred_are_min_and_max() {
        let mut h = Histogram::with_default_buckets();
        for v in [5.0, 1.0, 9.0, 3.0] {
            h.observe(v);
        }
        assert_eq!(h.percentile(0.0), Some(1.0));
        assert_eq!(h.percentile(100.0), Some(9.0));
    }

    #[test]
    fn percentile_on_empty_histogram_is_none() {
        let h = Histogram::with_default_buckets();
        assert_eq!(h.percentile(50.0), None);
    }

    #[test]
    #[should_panic]
    fn percentile_out_of_range_panics() {
        let h = Histogram::with_default_buckets();
        h.percentile(101.0);
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let mut h = Histogram::with_default_buckets();
        for v in [1.0, 2.0, 3.0, 4.0] {
            h.observe(v);
        }
        // n=4, p=50 -> pos = 3*0.5 = 1.5 -> interpolate between sorted[1]=2 and sorted[2]=3
        assert_eq!(h.percentile(50.0), Some(2.5));
    }

    #[test]
    fn gauge_set_inc_dec() {
        let mut g = Gauge::default();
        g.set(10.0);
        g.inc(5.0);
        g.dec(2.0);
        assert_eq!(g.get(), 13.0);
    }

    #[test]
    fn collector_pre_registers_canonical_metrics() {
        let collector = MetricsCollector::new();
        assert_eq!(collector.counter_value(names::COMMANDS_SENT_TOTAL), Some(0.0));
        assert_eq!(collector.gauge_value(names::QUEUE_SIZE), Some(0.0));
        collector.inc_counter(names::COMMANDS_SENT_TOTAL, 1.0);
        assert_eq!(collector.counter_value(names::COMMANDS_SENT_TOTAL), Some(1.0));
    }

    #[test]
    fn reset_zeroes_without_unregistering() {
        let collector = MetricsCollector::new();
        collector.inc_counter(names::COMMANDS_SENT_TOTAL, 5.0);
        collector.reset();
        assert_eq!(collector.counter_value(names::COMMANDS_SENT_TOTAL), Some(0.0));
    }
}
