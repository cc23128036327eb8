//! Retry delay calculation for the command execution path.
//!
//! The retry loop itself lives in [`crate::bus`], since it needs two-way
//! signalling with the circuit breaker (stop early if the breaker opens)
//! that a standalone policy object can't express on its own. This module
//! only owns the delay formula and its configuration, in the same spirit as
//! the exponential-backoff-with-cap calculation this crate has always used.

use std::time::Duration;

use crate::jitter::Jitter;

/// Retry configuration for a command's resilient execution path.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after attempt `attempt` (1-indexed) before the next one.
    ///
    /// `raw = min(initial_delay * exponential_base^(attempt-1), max_delay)`,
    /// then full jitter (`uniform(0, raw)`) is applied unless disabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let multiplier = self.exponential_base.powi(exponent);
        let raw_millis = (self.initial_delay.as_millis() as f64) * multiplier;
        let capped_millis = raw_millis.min(self.max_delay.as_millis() as f64);
        let raw = Duration::from_millis(capped_millis.max(0.0) as u64);

        let jitter = if self.jitter { Jitter::Full } else { Jitter::None };
        jitter.apply(raw)
    }

    /// Total attempts an `execute` call will make: the first try plus `max_retries` retries.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_without_jitter() {
        let cfg = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(10),
            exponential_base: 2.0,
            jitter: false,
        };
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(cfg.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(cfg.delay_for_attempt(3), Duration::from_millis(40));
    }

    #[test]
    fn delay_is_capped_at_max_delay() {
        let cfg = RetryConfig {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            exponential_base: 2.0,
            jitter: false,
        };
        assert_eq!(cfg.delay_for_attempt(10), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_raw_bound() {
        let cfg = RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            exponential_base: 2.0,
            jitter: true,
        };
        for attempt in 1..=3 {
            let raw = {
                let mut no_jitter = cfg.clone();
                no_jitter.jitter = false;
                no_jitter.delay_for_attempt(attempt)
            };
            let jittered = cfg.delay_for_attempt(attempt);
            assert!(jittered <= raw);
        }
    }

    #[test]
    fn max_attempts_is_retries_plus_one() {
        let cfg = RetryConfig { max_retries: 0, ..RetryConfig::default() };
        assert_eq!(cfg.max_attempts(), 1);
        let cfg = RetryConfig { max_retries: 2, ..RetryConfig::default() };
        assert_eq!(cfg.max_attempts(), 3);
    }
}
