//! The dispatch core: owns the handler registry, the bounded event queue, the
//! per-command-type circuit breakers, the dead-letter store, and metrics, and
//! ties them together behind `execute`/`publish` (C8). Constructed only
//! through [`crate::config::BusBuilder`] — never a global singleton, so a
//! process can run more than one bus with independent state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use crate::clock::Clock;
use crate::command::{Command, CommandResult};
use crate::config::BusConfig;
use crate::dead_letter::{DeadLetterEntry, DeadLetterStore, RetryThunk};
use crate::error::BusError;
use crate::event::{CommandResultEvent, CommandStartedEvent, DeadLetterAddedEvent, Event, EventHandlerFailedEvent};
use crate::filters::EventFilter;
use crate::message::{Message, MessageMeta, SessionId, BUS_SESSION};
use crate::metrics::{names, MetricsCollector};
use crate::middleware::{
    build_command_chain, build_event_chain, CommandMiddleware, CommandNext, EventMiddleware, EventNext,
};
use crate::queue::BoundedEventQueue;
use crate::registry::{EventHandlerResult, HandlerError, HandlerRegistry};
use crate::scheduled::{ScheduledEvent, ScheduledEventStore};
use crate::session::Session;
use crate::sink::ObservabilitySink;
use crate::sleeper::Sleeper;

/// Built fresh for each `publish`, capturing the concrete event type so the
/// dispatch loop never has to downcast the type-erased queue entry back to
/// `E` to look up its handlers.
type DispatchFn = Arc<dyn Fn() -> Vec<(i32, BoxFuture<'static, EventHandlerResult>)> + Send + Sync>;

struct QueuedEvent {
    event: Arc<dyn Event>,
    event_type: &'static str,
    dispatch: DispatchFn,
}

/// Per-command-type or per-event-type failure bookkeeping, surfaced through
/// [`Bus::get_handler_error_stats`].
#[derive(Debug, Clone, Default)]
pub struct HandlerErrorStats {
    pub total_failures: u64,
    pub last_error: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Point-in-time snapshot of bus health, surfaced through [`Bus::get_stats`].
#[derive(Debug, Clone)]
pub struct BusStats {
    pub running: bool,
    pub queue_size: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub error_suppression: bool,
    pub total_errors: u64,
    pub active_sessions: usize,
    pub dead_letter_size: usize,
}

struct Inner {
    config: BusConfig,
    registry: HandlerRegistry,
    queue: BoundedEventQueue<QueuedEvent>,
    metrics: MetricsCollector,
    circuit_breakers: CircuitBreakerRegistry,
    dead_letters: DeadLetterStore,
    sink: Arc<dyn ObservabilitySink>,
    scheduled_store: Arc<dyn ScheduledEventStore>,
    #[allow(dead_code)]
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    command_middlewares: Mutex<Vec<Arc<dyn CommandMiddleware>>>,
    event_middlewares: Mutex<Vec<Arc<dyn EventMiddleware>>>,
    filters: Mutex<Vec<Box<dyn EventFilter>>>,
    handler_error_stats: Mutex<HashMap<&'static str, HandlerErrorStats>>,
    running: AtomicBool,
    error_suppression: AtomicBool,
    batch_size: AtomicUsize,
    batch_timeout_ms: AtomicU64,
    active_sessions: AtomicUsize,
    shutdown_grace: Duration,
    dispatch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let active = self.active_sessions.load(Ordering::SeqCst);
        if active > 0 {
            tracing::warn!(active_sessions = active, "bus dropped with sessions still active");
        }
    }
}

/// A cheaply-cloneable handle to the dispatch core. Every clone shares the
/// same queue, registry, and counters.
#[derive(Clone)]
pub struct Bus(Arc<Inner>);

impl Bus {
    pub(crate) fn new(
        config: BusConfig,
        sink: Arc<dyn ObservabilitySink>,
        scheduled_store: Arc<dyn ScheduledEventStore>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, BusError> {
        let queue = BoundedEventQueue::<QueuedEvent>::builder()
            .maxsize(config.queue_maxsize)
            .watermarks(config.queue_low_water, config.queue_high_water)
            .strategy(config.queue_strategy)
            .build()?;
        let circuit_breakers = CircuitBreakerRegistry::with_clock(config.circuit_breaker.clone(), clock.clone());
        let dead_letters = DeadLetterStore::new(config.dead_letter_capacity);
        let batch_size = config.batch_size;
        let batch_timeout_ms = config.batch_timeout.as_millis() as u64;
        let error_suppression = config.error_suppression;
        let shutdown_grace = config.shutdown_grace;

        Ok(Self(Arc::new(Inner {
            config,
            registry: HandlerRegistry::new(),
            queue,
            metrics: MetricsCollector::new(),
            circuit_breakers,
            dead_letters,
            sink,
            scheduled_store,
            clock,
            sleeper,
            command_middlewares: Mutex::new(Vec::new()),
            event_middlewares: Mutex::new(Vec::new()),
            filters: Mutex::new(Vec::new()),
            handler_error_stats: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            error_suppression: AtomicBool::new(error_suppression),
            batch_size: AtomicUsize::new(batch_size),
            batch_timeout_ms: AtomicU64::new(batch_timeout_ms),
            active_sessions: AtomicUsize::new(0),
            shutdown_grace,
            dispatch_handle: Mutex::new(None),
        })))
    }

    /// Idempotent. Replays any scheduled events a [`ScheduledEventStore`]
    /// persisted across a prior `stop`, then spawns the dispatch loop.
    pub async fn start(&self) {
        if self.0.running.swap(true, Ordering::SeqCst) {
            return;
        }
        for ev in self.0.scheduled_store.load_unfinished_events() {
            let _ = self.publish(ev, false).await;
        }
        let handle = tokio::spawn(Self::dispatch_loop(self.clone()));
        *self.0.dispatch_handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    /// Idempotent. Waits up to `shutdown_grace` for the dispatch loop to
    /// drain in flight work, aborting it past that, then persists whatever
    /// scheduled events are still pending.
    pub async fn stop(&self) {
        if !self.0.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self.0.dispatch_handle.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(self.0.shutdown_grace, &mut handle).await.is_err() {
                tracing::warn!("dispatch loop did not stop within the shutdown grace period, aborting");
                handle.abort();
            }
        }
        let remaining = self.0.queue.drain_matching(|_| true);
        let to_save: Vec<ScheduledEvent> = remaining
            .into_iter()
            .filter_map(|item| item.event.as_any().downcast_ref::<ScheduledEvent>().cloned())
            .collect();
        self.0.scheduled_store.save_unfinished_events(to_save);
    }

    /// Resets metrics and circuit breaker state. Registered handlers and the
    /// dead-letter store are left untouched — this isn't a full re-init.
    pub fn reset(&self) {
        self.0.metrics.reset();
        self.0.circuit_breakers.reset_all();
    }

    pub fn register_command_handler<C, F, Fut>(&self, handler: F) -> Result<(), BusError>
    where
        C: Command + 'static,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = CommandResult> + Send + 'static,
    {
        self.register_command_handler_scoped::<C, _, _>(BUS_SESSION.to_string(), handler)
    }

    pub fn register_command_handler_scoped<C, F, Fut>(
        &self,
        session_id: impl Into<SessionId>,
        handler: F,
    ) -> Result<(), BusError>
    where
        C: Command + 'static,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = CommandResult> + Send + 'static,
    {
        self.0.registry.register_command_handler::<C, _, _>(session_id, handler)?;
        self.record_handler_count();
        Ok(())
    }

    pub fn register_event_handler<E, F, Fut>(&self, priority: i32, handler: F)
    where
        E: Event + 'static,
        F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = EventHandlerResult> + Send + 'static,
    {
        self.register_event_handler_scoped::<E, _, _>(BUS_SESSION.to_string(), priority, handler)
    }

    pub fn register_event_handler_scoped<E, F, Fut>(
        &self,
        session_id: impl Into<SessionId>,
        priority: i32,
        handler: F,
    ) where
        E: Event + 'static,
        F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = EventHandlerResult> + Send + 'static,
    {
        self.0.registry.register_event_handler::<E, _, _>(session_id, priority, handler);
        self.record_handler_count();
    }

    pub fn unregister_session_handlers(&self, session_id: &str) -> Result<(), BusError> {
        self.0.registry.unregister_session(session_id)?;
        self.record_handler_count();
        Ok(())
    }

    fn record_handler_count(&self) {
        let stats = self.0.registry.handler_stats();
        self.0
            .metrics
            .set_gauge(names::REGISTERED_HANDLERS, (stats.command_handlers + stats.event_handlers) as f64);
    }

    pub fn add_command_middleware(&self, middleware: Arc<dyn CommandMiddleware>) {
        self.0.command_middlewares.lock().unwrap_or_else(|p| p.into_inner()).push(middleware);
    }

    pub fn add_event_middleware(&self, middleware: Arc<dyn EventMiddleware>) {
        self.0.event_middlewares.lock().unwrap_or_else(|p| p.into_inner()).push(middleware);
    }

    pub fn add_event_filter(&self, filter: Box<dyn EventFilter>) {
        self.0.filters.lock().unwrap_or_else(|p| p.into_inner()).push(filter);
    }

    /// Opens a new session, generating a UUID if `id` is `None`.
    pub async fn session(&self, id: Option<SessionId>) -> Session {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.0.active_sessions.fetch_add(1, Ordering::SeqCst);
        self.0.metrics.inc_gauge(names::ACTIVE_SESSIONS, 1.0);
        Session::start(self.clone(), id).await
    }

    pub(crate) fn session_ended(&self) {
        self.0.active_sessions.fetch_sub(1, Ordering::SeqCst);
        self.0.metrics.dec_gauge(names::ACTIVE_SESSIONS, 1.0);
    }

    /// Routes `cmd` to its registered handler through the middleware chain,
    /// retrying on failure per the configured [`RetryConfig`](crate::retry::RetryConfig)
    /// and gating on the command type's circuit breaker. Never panics or
    /// propagates an error: every outcome, including "no handler registered"
    /// and "circuit open", comes back as a `CommandResult` with `success = false`.
    pub async fn execute<C: Command + Clone + 'static>(&self, cmd: C) -> CommandResult {
        let command_type = std::any::type_name::<C>();
        let session_id = cmd.session_id().to_string();
        let command_id = cmd.message_id().to_string();

        self.0.metrics.inc_counter(names::COMMANDS_SENT_TOTAL, 1.0);

        let handler = match self.0.registry.get_command_handler::<C>(&session_id) {
            Some(handler) => handler,
            None => {
                self.0.metrics.inc_counter(names::COMMANDS_FAILED_TOTAL, 1.0);
                return CommandResult::err(command_id, format!("no handler registered for {command_type}"));
            }
        };

        let _ = self
            .publish(
                CommandStartedEvent {
                    meta: MessageMeta::for_session(session_id.clone()),
                    command_type,
                    command_id: command_id.clone(),
                },
                false,
            )
            .await;

        if self.0.circuit_breakers.gate::<C>(command_type).is_err() {
            self.0.circuit_breakers.record_metrics(&self.0.metrics);
            let result = CommandResult::err(command_id.clone(), format!("circuit breaker open for {command_type}"))
                .with_metadata("circuit_open", true);
            self.0.metrics.inc_counter(names::COMMANDS_FAILED_TOTAL, 1.0);
            let _ = self
                .publish(
                    CommandResultEvent {
                        meta: MessageMeta::for_session(session_id.clone()),
                        command_type,
                        result: result.clone(),
                    },
                    false,
                )
                .await;
            return result;
        }

        let retry = self.0.config.retry.clone();
        let max_attempts = retry.max_attempts();
        let mut attempt = 1u32;
        let mut handler_time = Duration::ZERO;
        let mut result;
        loop {
            let middlewares = self.0.command_middlewares.lock().unwrap_or_else(|p| p.into_inner()).clone();
            let handler = handler.clone();
            let terminal: CommandNext = Arc::new(move |boxed: Box<dyn Command>| {
                let handler = handler.clone();
                Box::pin(async move {
                    let typed = boxed
                        .as_any()
                        .downcast_ref::<C>()
                        .expect("command type mismatch between registration and dispatch")
                        .clone();
                    handler(typed).await
                })
            });
            let chain = build_command_chain(&middlewares, command_type, terminal);
            let attempt_start = Instant::now();
            result = chain(Box::new(cmd.clone())).await;
            handler_time += attempt_start.elapsed();

            if result.success {
                self.0.circuit_breakers.report_success::<C>(command_type);
                self.0.circuit_breakers.record_metrics(&self.0.metrics);
                break;
            }

            self.record_handler_error(command_type, result.error.clone().unwrap_or_default());
            let tripped = self.0.circuit_breakers.report_failure::<C>(command_type);
            self.0.circuit_breakers.record_metrics(&self.0.metrics);
            if tripped || attempt >= max_attempts {
                break;
            }
            self.0.sleeper.sleep(retry.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
        self.0
            .metrics
            .observe_histogram(names::COMMAND_PROCESSING_DURATION_SECONDS, handler_time.as_secs_f64());

        if result.success {
            self.0.metrics.inc_counter(names::COMMANDS_PROCESSED_TOTAL, 1.0);
        } else {
            self.0.metrics.inc_counter(names::COMMANDS_FAILED_TOTAL, 1.0);
            result = self.dead_letter(command_type, command_id.clone(), session_id.clone(), cmd.clone(), attempt, result).await;
        }

        let _ = self
            .publish(
                CommandResultEvent {
                    meta: MessageMeta::for_session(session_id),
                    command_type,
                    result: result.clone(),
                },
                false,
            )
            .await;

        result
    }

    async fn dead_letter<C: Command + Clone + 'static>(
        &self,
        command_type: &'static str,
        command_id: String,
        session_id: String,
        cmd: C,
        attempts: u32,
        result: CommandResult,
    ) -> CommandResult {
        let bus = self.clone();
        let retry_thunk: RetryThunk = Arc::new(move || {
            let bus = bus.clone();
            let cmd = cmd.clone();
            Box::pin(async move { bus.execute(cmd).await })
        });
        let now = Utc::now();
        let error = result.error.clone().unwrap_or_default();
        let entry = DeadLetterEntry {
            command_type,
            command_id: command_id.clone(),
            error: error.clone(),
            attempts,
            first_attempt: now,
            last_attempt: now,
            metadata: result.metadata.clone(),
            retry_thunk,
        };
        self.0.dead_letters.put(entry);
        self.0.metrics.set_gauge(names::DEAD_LETTER_QUEUE_SIZE, self.0.dead_letters.size() as f64);
        let _ = self
            .publish(
                DeadLetterAddedEvent {
                    meta: MessageMeta::for_session(session_id),
                    command_type,
                    command_id,
                    attempts,
                    error,
                },
                false,
            )
            .await;
        result.with_metadata("dead_letter", true)
    }

    fn record_handler_error(&self, source: &'static str, error: String) {
        let mut stats = self.0.handler_error_stats.lock().unwrap_or_else(|p| p.into_inner());
        let entry = stats.entry(source).or_default();
        entry.total_failures += 1;
        entry.last_error = Some(error);
        entry.last_failure_at = Some(Utc::now());
    }

    /// Publishes `event`: runs it past the observability sink and every
    /// registered filter, then enqueues it for the dispatch loop. A filter
    /// rejection drops the event silently (§7 `FilteredOut`). If
    /// `await_processing` is set and the event isn't scheduled for the
    /// future, synchronously drains and runs the due portion of the queue
    /// before returning.
    pub async fn publish<E: Event + 'static>(&self, event: E, await_processing: bool) -> Result<(), HandlerError> {
        let event_type = std::any::type_name::<E>();
        let session_id = event.session_id().to_string();

        let sink = self.0.sink.clone();
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            sink.observe_event(&event, &session_id, event_type);
        }))
        .is_err()
        {
            tracing::warn!(event_type, "observability sink panicked, ignoring");
        }

        let allowed = {
            let filters = self.0.filters.lock().unwrap_or_else(|p| p.into_inner());
            filters.iter().all(|f| f.allow(&event, &session_id, event_type))
        };
        if !allowed {
            tracing::debug!(event_type, session_id, "event dropped by filter");
            return Ok(());
        }

        let is_scheduled = event.scheduled_time().is_some();
        let typed: Arc<E> = Arc::new(event);
        let erased: Arc<dyn Event> = typed.clone();

        let bus = self.clone();
        let dispatch_session = session_id.clone();
        let dispatch: DispatchFn = Arc::new(move || {
            let handlers = bus.0.registry.get_event_handlers_with_priority::<E>(&dispatch_session);
            let middlewares = bus.0.event_middlewares.lock().unwrap_or_else(|p| p.into_inner()).clone();
            handlers
                .into_iter()
                .map(|(priority, handler)| {
                    let typed_for_handler = typed.clone();
                    let terminal: EventNext = Arc::new(move |_erased: Arc<dyn Event>| {
                        let handler = handler.clone();
                        let typed_for_handler = typed_for_handler.clone();
                        Box::pin(async move { handler(typed_for_handler).await })
                    });
                    let chain = build_event_chain(&middlewares, event_type, terminal);
                    let erased_for_chain: Arc<dyn Event> = typed.clone();
                    (priority, chain(erased_for_chain))
                })
                .collect()
        });

        let queued = QueuedEvent { event: erased, event_type, dispatch };
        if !self.0.queue.put(queued).await {
            tracing::warn!(event_type, session_id, "event rejected by queue backpressure policy");
        }
        self.0.metrics.inc_counter(names::EVENTS_PUBLISHED_TOTAL, 1.0);
        self.0.metrics.set_gauge(names::QUEUE_SIZE, self.0.queue.size() as f64);
        self.0
            .metrics
            .set_gauge(names::BACKPRESSURE_ACTIVE, if self.0.queue.is_backpressure_active() { 1.0 } else { 0.0 });

        if await_processing && !is_scheduled {
            self.wait_for_events().await?;
        }
        Ok(())
    }

    /// Synchronously drains every currently-due (non-scheduled, or scheduled
    /// and past its fire time) item and processes it.
    async fn wait_for_events(&self) -> Result<(), HandlerError> {
        let due = self
            .0
            .queue
            .drain_matching(|item| item.event.scheduled_time().map(|t| Utc::now() >= t).unwrap_or(true));
        self.process_batch(due).await
    }

    async fn process_batch(&self, batch: Vec<QueuedEvent>) -> Result<(), HandlerError> {
        let mut futures = Vec::new();
        for item in batch {
            let event_type = item.event_type;
            let event_id = item.event.message_id();
            for (priority, fut) in (item.dispatch)() {
                futures.push(async move {
                    let start = Instant::now();
                    let result = fut.await;
                    (event_type, event_id, priority, result, start.elapsed())
                });
            }
        }
        let results = join_all(futures).await;

        let mut first_err = None;
        for (event_type, event_id, priority, result, elapsed) in results {
            self.0.metrics.observe_histogram(names::EVENT_PROCESSING_DURATION_SECONDS, elapsed.as_secs_f64());
            match result {
                Ok(()) => self.0.metrics.inc_counter(names::EVENTS_PROCESSED_TOTAL, 1.0),
                Err(err) => {
                    self.0.metrics.inc_counter(names::EVENTS_FAILED_TOTAL, 1.0);
                    self.record_handler_error(event_type, err.to_string());
                    if self.0.error_suppression.load(Ordering::SeqCst) {
                        let _ = Box::pin(self.publish(
                            EventHandlerFailedEvent {
                                meta: MessageMeta::new(),
                                event_type,
                                event_id,
                                handler_priority: priority,
                                error: err.to_string(),
                            },
                            false,
                        ))
                        .await;
                    } else if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn dispatch_loop(bus: Bus) {
        while bus.0.running.load(Ordering::SeqCst) {
            let batch_size = bus.0.batch_size.load(Ordering::SeqCst);
            let batch_timeout = Duration::from_millis(bus.0.batch_timeout_ms.load(Ordering::SeqCst));
            let deadline = tokio::time::Instant::now() + batch_timeout;
            let mut batch = Vec::with_capacity(batch_size);

            while batch.len() < batch_size {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, bus.0.queue.get()).await {
                    Ok(item) => {
                        if let Some(fire_at) = item.event.scheduled_time() {
                            if Utc::now() < fire_at {
                                bus.0.queue.put(item).await;
                                continue;
                            }
                        }
                        batch.push(item);
                    }
                    Err(_) => break,
                }
            }

            if !batch.is_empty() {
                if let Err(err) = bus.process_batch(batch).await {
                    tracing::warn!(error = %err, "event batch processing returned an unsuppressed error");
                }
            }
            bus.0.metrics.set_gauge(names::QUEUE_SIZE, bus.0.queue.size() as f64);
            bus.0
                .metrics
                .set_gauge(names::BACKPRESSURE_ACTIVE, if bus.0.queue.is_backpressure_active() { 1.0 } else { 0.0 });
        }
    }

    pub fn get_metrics(&self) -> &MetricsCollector {
        &self.0.metrics
    }

    pub fn get_stats(&self) -> BusStats {
        let total_errors = self
            .0
            .handler_error_stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|s| s.total_failures)
            .sum();
        BusStats {
            running: self.0.running.load(Ordering::SeqCst),
            queue_size: self.0.queue.size(),
            batch_size: self.0.batch_size.load(Ordering::SeqCst),
            batch_timeout: Duration::from_millis(self.0.batch_timeout_ms.load(Ordering::SeqCst)),
            error_suppression: self.0.error_suppression.load(Ordering::SeqCst),
            total_errors,
            active_sessions: self.0.active_sessions.load(Ordering::SeqCst),
            dead_letter_size: self.0.dead_letters.size(),
        }
    }

    pub fn get_handler_error_stats(&self) -> HashMap<&'static str, HandlerErrorStats> {
        self.0.handler_error_stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn get_circuit_breaker_states(&self) -> Vec<(&'static str, CircuitState)> {
        self.0.circuit_breakers.states()
    }

    pub fn dead_letter_entries(&self, limit: Option<usize>) -> Vec<DeadLetterEntry> {
        self.0.dead_letters.entries(limit)
    }

    /// Resubmits a dead-lettered command through the normal `execute` path,
    /// removing it from the store first so a concurrent retry can't double-fire it.
    pub fn retry_dead_letter(&self, command_id: &str) -> Option<BoxFuture<'static, CommandResult>> {
        let (_, thunk) = self.0.dead_letters.take_for_retry(command_id)?;
        self.0.metrics.set_gauge(names::DEAD_LETTER_QUEUE_SIZE, self.0.dead_letters.size() as f64);
        Some(thunk())
    }

    pub fn suppress_event_errors(&self) {
        self.0.error_suppression.store(true, Ordering::SeqCst);
    }

    pub fn unsuppress_event_errors(&self) {
        self.0.error_suppression.store(false, Ordering::SeqCst);
    }

    pub fn set_batch_processing(&self, size: usize, timeout: Duration) {
        self.0.batch_size.store(size, Ordering::SeqCst);
        self.0.batch_timeout_ms.store(timeout.as_millis() as u64, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::config::BusBuilder;
    use crate::message::impl_message_via_meta;
    use crate::retry::RetryConfig;
    use crate::sleeper::InstantSleeper;
    use std::any::Any;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone)]
    struct Add {
        meta: MessageMeta,
        a: i64,
        b: i64,
    }
    impl_message_via_meta!(Add);
    impl Command for Add {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug, Clone)]
    struct Ping {
        meta: MessageMeta,
    }
    impl_message_via_meta!(Ping);
    impl Event for Ping {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[tokio::test]
    async fn execute_calls_registered_handler() {
        let bus = BusBuilder::new().build().unwrap();
        bus.register_command_handler::<Add, _, _>(|cmd: Add| async move {
            CommandResult::ok("sum", serde_json::json!(cmd.a + cmd.b))
        })
        .unwrap();

        let result = bus.execute(Add { meta: MessageMeta::new(), a: 2, b: 3 }).await;
        assert!(result.success);
        assert_eq!(result.result.unwrap(), serde_json::json!(5));
    }

    #[tokio::test]
    async fn execute_without_handler_fails_and_is_not_dead_lettered() {
        let bus = BusBuilder::new().build().unwrap();
        let result = bus.execute(Add { meta: MessageMeta::new(), a: 1, b: 1 }).await;
        assert!(!result.success);
        assert!(!result.is_dead_lettered());
        assert_eq!(bus.dead_letter_entries(None).len(), 0);
    }

    #[tokio::test]
    async fn retries_exhaust_then_dead_letter() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let config = BusConfig {
            retry: RetryConfig { max_retries: 2, jitter: false, initial_delay: Duration::from_millis(1), ..RetryConfig::default() },
            ..BusConfig::default()
        };
        let bus = BusBuilder::new().config(config).sleeper(Arc::new(InstantSleeper)).build().unwrap();
        bus.register_command_handler::<Add, _, _>(move |_: Add| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                CommandResult::err("c1", "always fails")
            }
        })
        .unwrap();

        let result = bus.execute(Add { meta: MessageMeta::new(), a: 1, b: 1 }).await;
        assert!(!result.success);
        assert!(result.is_dead_lettered());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(bus.dead_letter_entries(None).len(), 1);
    }

    #[tokio::test]
    async fn circuit_breaker_short_circuits_after_threshold() {
        let config = BusConfig {
            retry: RetryConfig { max_retries: 0, ..RetryConfig::default() },
            circuit_breaker: CircuitBreakerConfig { failure_threshold: 2, ..CircuitBreakerConfig::default() },
            ..BusConfig::default()
        };
        let bus = BusBuilder::new().config(config).sleeper(Arc::new(InstantSleeper)).build().unwrap();
        bus.register_command_handler::<Add, _, _>(|_: Add| async { CommandResult::err("c1", "boom") }).unwrap();

        let first = bus.execute(Add { meta: MessageMeta::new(), a: 0, b: 0 }).await;
        assert!(!first.success && !first.metadata.contains_key("circuit_open"));

        let second = bus.execute(Add { meta: MessageMeta::new(), a: 0, b: 0 }).await;
        assert!(!second.success && !second.metadata.contains_key("circuit_open"));

        let third = bus.execute(Add { meta: MessageMeta::new(), a: 0, b: 0 }).await;
        assert!(third.metadata.contains_key("circuit_open"));
        assert!(!third.is_dead_lettered());
    }

    #[tokio::test]
    async fn publish_reaches_session_and_bus_scoped_handlers() {
        let bus = BusBuilder::new().build().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_bus = seen.clone();
        bus.register_event_handler::<Ping, _, _>(crate::registry::priority::NORMAL, move |_| {
            let seen = seen_bus.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.publish(Ping { meta: MessageMeta::for_session("s1".into()) }, true).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_letter_retry_resubmits_through_execute() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = attempts.clone();
        let config = BusConfig { retry: RetryConfig { max_retries: 0, ..RetryConfig::default() }, ..BusConfig::default() };
        let bus = BusBuilder::new().config(config).sleeper(Arc::new(InstantSleeper)).build().unwrap();
        bus.register_command_handler::<Add, _, _>(move |_: Add| {
            let attempts = attempts2.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    CommandResult::err("c1", "transient")
                } else {
                    CommandResult::ok("c1", serde_json::json!(null))
                }
            }
        })
        .unwrap();

        let cmd = Add { meta: MessageMeta::new(), a: 1, b: 1 };
        let command_id = cmd.meta.message_id.to_string();
        let first = bus.execute(cmd).await;
        assert!(first.is_dead_lettered());

        let retried = bus.retry_dead_letter(&command_id).unwrap().await;
        assert!(retried.success);
        assert_eq!(bus.dead_letter_entries(None).len(), 0);
    }
}
