//! Session: a scoped unit of handler registration with guaranteed but
//! explicit cleanup (C10).
//!
//! Not `Drop`-based: ending a session publishes `SessionEndEvent`, and
//! publishing requires `.await`, which `Drop::drop` can't do. Cleanup is
//! instead an explicit `async fn end(self)` that consumes the session, so the
//! type system catches any attempt to use it afterward. A session that is
//! simply dropped without calling `end()` logs a warning (§4.10) rather than
//! silently cleaning up, since a synchronous `Drop` impl would need to skip
//! `SessionEndEvent` entirely to stay non-blocking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bus::Bus;
use crate::command::{Command, CommandResult};
use crate::error::BusError;
use crate::event::{Event, SessionEndEvent, SessionStartEvent};
use crate::message::{MessageMeta, SessionId};
use crate::registry::EventHandlerResult;

/// A session-scoped handle onto a [`Bus`]. Commands/events registered
/// through a session are visible only within it — unioned with `BUS`-scope
/// handlers for events, falling back to `BUS`-scope for commands (§2) —
/// until [`Session::end`] removes them.
pub struct Session {
    bus: Bus,
    id: SessionId,
    started_at: Instant,
    active: AtomicBool,
}

impl Session {
    pub(crate) async fn start(bus: Bus, id: SessionId) -> Self {
        let _ = bus.publish(SessionStartEvent { meta: MessageMeta::for_session(id.clone()) }, false).await;
        Self { bus, id, started_at: Instant::now(), active: AtomicBool::new(true) }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn register_command_handler<C, F, Fut>(&self, handler: F) -> Result<(), BusError>
    where
        C: Command + 'static,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = CommandResult> + Send + 'static,
    {
        self.bus.register_command_handler_scoped::<C, _, _>(self.id.clone(), handler)
    }

    pub fn register_event_handler<E, F, Fut>(&self, priority: i32, handler: F)
    where
        E: Event + 'static,
        F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = EventHandlerResult> + Send + 'static,
    {
        self.bus.register_event_handler_scoped::<E, _, _>(self.id.clone(), priority, handler);
    }

    /// Forwards `cmd` to the bus. `cmd`'s own `session_id` must already match
    /// this session — built-in message types get this via
    /// [`MessageMeta::for_session`]; there's no generic way to stamp an
    /// arbitrary `C`'s embedded meta after construction, so a mismatch is
    /// caught here instead and rejected as a misuse error.
    pub async fn execute<C: Command + Clone + 'static>(&self, cmd: C) -> Result<CommandResult, BusError> {
        if !self.is_active() {
            return Err(BusError::SessionMisuse(self.id.clone()));
        }
        if cmd.session_id() != self.id {
            return Err(BusError::SessionMisuse(self.id.clone()));
        }
        Ok(self.bus.execute(cmd).await)
    }

    /// Forwards `event` to the bus; see [`Session::execute`] for the
    /// session-id matching contract this relies on.
    pub async fn publish<E: Event + 'static>(&self, event: E, await_processing: bool) -> Result<(), BusError> {
        if !self.is_active() {
            return Err(BusError::SessionMisuse(self.id.clone()));
        }
        if event.session_id() != self.id {
            return Err(BusError::SessionMisuse(self.id.clone()));
        }
        self.bus.publish(event, await_processing).await.map_err(|e| BusError::HandlerFailed(e.to_string()))
    }

    /// Unregisters every handler this session registered and publishes
    /// `SessionEndEvent` with no error. Consumes `self`.
    pub async fn end(self) {
        self.end_with_error(None).await
    }

    /// Same as [`Session::end`], but records `error` on the published
    /// `SessionEndEvent` — for a session ending because its owning task failed.
    pub async fn end_with_error(self, error: Option<String>) {
        if self.active.swap(false, Ordering::SeqCst) {
            let duration = self.started_at.elapsed();
            if let Err(e) = self.bus.unregister_session_handlers(&self.id) {
                tracing::warn!(session_id = %self.id, error = %e, "failed to unregister session handlers");
            }
            let _ = self
                .bus
                .publish(
                    SessionEndEvent { meta: MessageMeta::for_session(self.id.clone()), duration, error },
                    false,
                )
                .await;
            self.bus.session_ended();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.active.load(Ordering::SeqCst) {
            tracing::warn!(session_id = %self.id, "session dropped without calling end()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusBuilder;
    use crate::message::Message;
    use std::any::Any;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone)]
    struct Ping {
        meta: MessageMeta,
    }
    crate::message::impl_message_via_meta!(Ping);
    impl Event for Ping {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug, Clone)]
    struct Noop {
        meta: MessageMeta,
    }
    crate::message::impl_message_via_meta!(Noop);
    impl Command for Noop {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[tokio::test]
    async fn session_scoped_handler_is_invisible_outside_its_session() {
        let bus = BusBuilder::new().build().unwrap();
        let session = bus.session(Some("s1".into())).await;
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        session.register_event_handler::<Ping, _, _>(crate::registry::priority::NORMAL, move |_| {
            let count = count2.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.publish(Ping { meta: MessageMeta::for_session("s1".into()) }, true).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        bus.publish(Ping { meta: MessageMeta::for_session("other".into()) }, true).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        session.end().await;
    }

    #[tokio::test]
    async fn ending_a_session_removes_its_handlers() {
        let bus = BusBuilder::new().build().unwrap();
        let session = bus.session(Some("s2".into())).await;
        session.register_command_handler::<Noop, _, _>(|_| async { CommandResult::ok("n", serde_json::json!(null)) }).unwrap();
        session.end().await;

        let result = bus.execute(Noop { meta: MessageMeta::for_session("s2".into()) }).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn ended_session_rejects_further_use() {
        let bus = BusBuilder::new().build().unwrap();
        let session = bus.session(Some("s3".into())).await;
        session.end().await;
        // can't call methods on a consumed session; this test exists to
        // document that end() takes self by value, enforced at compile time.
    }
}
