//! Wrap-around middleware chains executed around a single handler invocation
//! (§4.4). Registration order determines execution order: the chain is built
//! by right-folding so the first-registered middleware sees the message
//! first and the result last, matching the source system's closure-capturing
//! chain construction (Design Notes: "middleware forms a singly-linked list;
//! invocation walks the list, each node responsible for calling the next or not").
//!
//! One chain of each kind is shared by every command/event type on the bus,
//! so middleware here is written against the type-erased `dyn Command` /
//! `dyn Event` rather than a generic type parameter — the per-type concrete
//! handler is only reached at the innermost link, built fresh by `Bus` for
//! each `execute`/`publish` call, which is where the concrete type is still
//! known (Design Notes §9: route on a runtime type identifier rather than
//! open-world reflection).

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::command::{Command, CommandResult};
use crate::event::Event;
use crate::message::Message;
use crate::registry::EventHandlerResult;

/// The remaining chain plus the handler, threaded through to the next
/// middleware. Calling it re-enters the chain at the next link (or the
/// handler itself, for the innermost middleware).
pub type CommandNext = Arc<dyn Fn(Box<dyn Command>) -> BoxFuture<'static, CommandResult> + Send + Sync>;
pub type EventNext = Arc<dyn Fn(Arc<dyn Event>) -> BoxFuture<'static, EventHandlerResult> + Send + Sync>;

pub trait CommandMiddleware: Send + Sync {
    fn call(&self, message: Box<dyn Command>, command_type: &'static str, next: CommandNext) -> BoxFuture<'static, CommandResult>;
}

pub trait EventMiddleware: Send + Sync {
    fn call(&self, message: Arc<dyn Event>, event_type: &'static str, next: EventNext) -> BoxFuture<'static, EventHandlerResult>;
}

/// Build the final callable chain around `handler`, applying middleware so
/// that `middlewares[0]` runs outermost (sees the message first, the result
/// last). A right fold over the registration order achieves this: fold from
/// the last-registered middleware inward, wrapping the accumulated `next`
/// each time, so the first-registered middleware ends up as the outermost wrapper.
pub fn build_command_chain(
    middlewares: &[Arc<dyn CommandMiddleware>],
    command_type: &'static str,
    handler: CommandNext,
) -> CommandNext {
    middlewares.iter().rev().fold(handler, |next, mw| {
        let mw = mw.clone();
        let next = next.clone();
        Arc::new(move |msg: Box<dyn Command>| mw.call(msg, command_type, next.clone()))
    })
}

pub fn build_event_chain(
    middlewares: &[Arc<dyn EventMiddleware>],
    event_type: &'static str,
    handler: EventNext,
) -> EventNext {
    middlewares.iter().rev().fold(handler, |next, mw| {
        let mw = mw.clone();
        let next = next.clone();
        Arc::new(move |msg: Arc<dyn Event>| mw.call(msg, event_type, next.clone()))
    })
}

/// Logs entry and exit of every handler invocation at debug level.
pub struct LoggingMiddleware {
    pub label: &'static str,
}

impl CommandMiddleware for LoggingMiddleware {
    fn call(&self, message: Box<dyn Command>, command_type: &'static str, next: CommandNext) -> BoxFuture<'static, CommandResult> {
        let label = self.label;
        let session_id = message.session_id().to_string();
        Box::pin(async move {
            tracing::debug!(label, session_id, command_type, "command middleware: entering handler");
            let result = next(message).await;
            tracing::debug!(label, success = result.success, "command middleware: handler returned");
            result
        })
    }
}

impl EventMiddleware for LoggingMiddleware {
    fn call(&self, message: Arc<dyn Event>, event_type: &'static str, next: EventNext) -> BoxFuture<'static, EventHandlerResult> {
        let label = self.label;
        let session_id = message.session_id().to_string();
        Box::pin(async move {
            tracing::debug!(label, session_id, event_type, "event middleware: entering handler");
            let result = next(message).await;
            if let Err(e) = &result {
                tracing::debug!(label, error = %e, "event middleware: handler failed");
            }
            result
        })
    }
}

/// Times the wrapped handler invocation and records it into a metrics histogram.
pub struct TimingMiddleware {
    pub metrics: Arc<crate::metrics::MetricsCollector>,
    pub histogram: &'static str,
}

impl CommandMiddleware for TimingMiddleware {
    fn call(&self, message: Box<dyn Command>, _command_type: &'static str, next: CommandNext) -> BoxFuture<'static, CommandResult> {
        let metrics = self.metrics.clone();
        let histogram = self.histogram;
        Box::pin(async move {
            let start = std::time::Instant::now();
            let result = next(message).await;
            metrics.observe_histogram(histogram, start.elapsed().as_secs_f64());
            result
        })
    }
}

impl EventMiddleware for TimingMiddleware {
    fn call(&self, message: Arc<dyn Event>, _event_type: &'static str, next: EventNext) -> BoxFuture<'static, EventHandlerResult> {
        let metrics = self.metrics.clone();
        let histogram = self.histogram;
        Box::pin(async move {
            let start = std::time::Instant::now();
            let result = next(message).await;
            metrics.observe_histogram(histogram, start.elapsed().as_secs_f64());
            result
        })
    }
}

/// Rejects commands with an empty `session_id` (besides the reserved `BUS`
/// scope, which is always valid) or an empty generated `command_id`.
pub struct ValidationMiddleware;

impl CommandMiddleware for ValidationMiddleware {
    fn call(&self, message: Box<dyn Command>, _command_type: &'static str, next: CommandNext) -> BoxFuture<'static, CommandResult> {
        Box::pin(async move {
            if message.session_id().is_empty() {
                return CommandResult::err(message.message_id().to_string(), "session_id must not be empty");
            }
            if message.message_id().to_string().is_empty() {
                return CommandResult::err("", "command_id must not be empty");
            }
            next(message).await
        })
    }
}

/// Per-command-type token-bucket rate limit; rejects with a failure result
/// rather than queuing, since commands have no bounded queue of their own.
pub struct RateLimitMiddleware {
    max_per_second: f64,
    window: std::sync::Mutex<(std::time::Instant, u32)>,
}

impl RateLimitMiddleware {
    pub fn new(max_per_second: f64) -> Self {
        Self { max_per_second, window: std::sync::Mutex::new((std::time::Instant::now(), 0)) }
    }
}

impl CommandMiddleware for RateLimitMiddleware {
    fn call(&self, message: Box<dyn Command>, _command_type: &'static str, next: CommandNext) -> BoxFuture<'static, CommandResult> {
        let allowed = {
            let mut guard = self.window.lock().unwrap_or_else(|p| p.into_inner());
            let now = std::time::Instant::now();
            if now.duration_since(guard.0) >= std::time::Duration::from_secs(1) {
                *guard = (now, 0);
            }
            if (guard.1 as f64) < self.max_per_second {
                guard.1 += 1;
                true
            } else {
                false
            }
        };
        Box::pin(async move {
            if allowed {
                next(message).await
            } else {
                CommandResult::err(message.message_id().to_string(), "rate limit exceeded")
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{impl_message_via_meta, MessageMeta};
    use std::any::Any;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone)]
    struct Add {
        meta: MessageMeta,
    }
    impl_message_via_meta!(Add);
    impl Command for Add {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct OrderRecording {
        log: Arc<StdMutex<Vec<&'static str>>>,
        label: &'static str,
    }

    impl CommandMiddleware for OrderRecording {
        fn call(&self, message: Box<dyn Command>, _command_type: &'static str, next: CommandNext) -> BoxFuture<'static, CommandResult> {
            let log = self.log.clone();
            let label = self.label;
            Box::pin(async move {
                log.lock().unwrap().push(label);
                next(message).await
            })
        }
    }

    fn terminal() -> CommandNext {
        Arc::new(|msg: Box<dyn Command>| {
            let id = msg.message_id().to_string();
            Box::pin(async move { CommandResult::ok(id, serde_json::json!(null)) })
        })
    }

    #[tokio::test]
    async fn chain_runs_first_registered_outermost() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let middlewares: Vec<Arc<dyn CommandMiddleware>> = vec![
            Arc::new(OrderRecording { log: log.clone(), label: "first" }),
            Arc::new(OrderRecording { log: log.clone(), label: "second" }),
        ];
        let chain = build_command_chain(&middlewares, "Add", terminal());
        chain(Box::new(Add { meta: MessageMeta::new() })).await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn validation_middleware_rejects_empty_session() {
        let middlewares: Vec<Arc<dyn CommandMiddleware>> = vec![Arc::new(ValidationMiddleware)];
        let chain = build_command_chain(&middlewares, "Add", terminal());
        let mut meta = MessageMeta::new();
        meta.session_id = String::new();
        let result = chain(Box::new(Add { meta })).await;
        assert!(!result.success);
    }
}
