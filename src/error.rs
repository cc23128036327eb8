//! Programmer-error and construction-time error taxonomy for the bus.
//!
//! `execute` itself never raises — failures are returned as a
//! [`CommandResult`](crate::command::CommandResult) with `success = false`.
//! `BusError` covers everything else: invalid configuration, duplicate
//! registration, and misuse of an inactive session.

use thiserror::Error;

/// Errors the bus's own API surface can return (as distinct from a handler's
/// own failures, which flow through `CommandResult`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("a handler is already registered for {command_type} in session {session_id}")]
    HandlerAlreadyRegistered { command_type: &'static str, session_id: String },

    #[error("invalid watermark configuration: low={low}, high={high} (require 0 < low < high <= 1)")]
    InvalidWatermarks { low: f64, high: f64 },

    #[error("invalid percentile {0}: must be in [0, 100]")]
    InvalidPercentile(f64),

    #[error("session {0} is not active")]
    SessionMisuse(String),

    #[error("the \"BUS\" scope cannot be unregistered")]
    CannotUnregisterBusScope,

    #[error("invalid retry configuration: {0}")]
    InvalidRetryConfig(&'static str),

    #[error("invalid circuit breaker configuration: {0}")]
    InvalidCircuitBreakerConfig(&'static str),

    #[error("event handler failed: {0}")]
    HandlerFailed(String),
}
