#![forbid(unsafe_code)]

//! # corebus
//!
//! An in-process message bus: commands (point-to-point, one handler, a
//! result) and events (broadcast, any number of handlers, no result),
//! dispatched through session-scoped handler registries with middleware
//! chains, publish-time filters, a bounded backpressure queue, retry with
//! exponential backoff, per-command-type circuit breakers, a dead-letter
//! queue, and built-in metrics.
//!
//! ## Quick start
//!
//! ```rust
//! use corebus::{BusBuilder, Command, CommandResult, Event, Message, MessageMeta};
//! use std::any::Any;
//!
//! #[derive(Debug, Clone)]
//! struct Add {
//!     meta: MessageMeta,
//!     a: i64,
//!     b: i64,
//! }
//! corebus::impl_message_via_meta!(Add);
//! impl Command for Add {
//!     fn as_any(&self) -> &dyn Any {
//!         self
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = BusBuilder::new().build().expect("valid bus config");
//!     bus.register_command_handler::<Add, _, _>(|cmd: Add| async move {
//!         CommandResult::ok("sum", serde_json::json!(cmd.a + cmd.b))
//!     })
//!     .expect("handler registered once");
//!
//!     let result = bus.execute(Add { meta: MessageMeta::new(), a: 2, b: 3 }).await;
//!     assert!(result.success);
//! }
//! ```

mod bus;
mod circuit_breaker;
mod clock;
mod command;
mod config;
mod dead_letter;
mod error;
mod event;
mod filters;
mod jitter;
mod message;
mod metrics;
mod middleware;
mod queue;
mod registry;
mod retry;
mod scheduled;
mod session;
mod sink;
mod sleeper;

pub use bus::{Bus, BusStats, HandlerErrorStats};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitOpenError, CircuitState};
pub use clock::{Clock, FakeClock, MonotonicClock};
pub use command::{Command, CommandResult};
pub use config::{BusBuilder, BusConfig};
pub use dead_letter::{DeadLetterEntry, DeadLetterStore, RetryThunk};
pub use error::BusError;
pub use event::{
    CommandResultEvent, CommandStartedEvent, DeadLetterAddedEvent, Event, EventHandlerFailedEvent,
    SessionEndEvent, SessionStartEvent,
};
pub use filters::{
    CompositeFilter, DebugFilter, EventFilter, EventTypeFilter, MetadataFilter, PatternFilter,
    RateLimitFilter, SessionFilter,
};
pub use jitter::Jitter;
pub use message::{
    impl_message_via_meta, Message, MessageId, MessageMeta, Metadata, MetadataValue, SessionId,
    BUS_SESSION,
};
pub use metrics::{names as metric_names, Counter, Gauge, Histogram, MetricsCollector};
pub use middleware::{
    build_command_chain, build_event_chain, CommandMiddleware, CommandNext, EventMiddleware,
    EventNext, LoggingMiddleware, RateLimitMiddleware, TimingMiddleware, ValidationMiddleware,
};
pub use queue::{BackpressureStrategy, BoundedEventQueue, BoundedEventQueueBuilder, QueueMetrics};
pub use registry::{priority, EventHandlerResult, HandlerError, HandlerRegistry, HandlerStats};
pub use retry::RetryConfig;
pub use scheduled::{InMemoryScheduledEventStore, NullScheduledEventStore, ScheduledEvent, ScheduledEventStore};
pub use session::Session;
pub use sink::{LogSink, MemorySink, NullSink, ObservabilitySink};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};

pub mod prelude;
