//! Convenient re-exports of the types most callers need.

pub use crate::{
    bus::{Bus, BusStats},
    circuit_breaker::{CircuitBreakerConfig, CircuitOpenError, CircuitState},
    command::{Command, CommandResult},
    config::{BusBuilder, BusConfig},
    error::BusError,
    event::{
        CommandResultEvent, CommandStartedEvent, DeadLetterAddedEvent, Event, EventHandlerFailedEvent,
        SessionEndEvent, SessionStartEvent,
    },
    filters::{
        CompositeFilter, DebugFilter, EventFilter, EventTypeFilter, MetadataFilter, PatternFilter,
        RateLimitFilter, SessionFilter,
    },
    message::{impl_message_via_meta, Message, MessageId, MessageMeta, Metadata, MetadataValue, BUS_SESSION},
    metrics::{names as metric_names, Counter, Gauge, Histogram, MetricsCollector},
    middleware::{
        CommandMiddleware, EventMiddleware, LoggingMiddleware, RateLimitMiddleware, TimingMiddleware,
        ValidationMiddleware,
    },
    queue::{BackpressureStrategy, BoundedEventQueue},
    registry::priority,
    retry::RetryConfig,
    scheduled::{InMemoryScheduledEventStore, NullScheduledEventStore, ScheduledEvent, ScheduledEventStore},
    session::Session,
    sink::{LogSink, MemorySink, NullSink, ObservabilitySink},
};
