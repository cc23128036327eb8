//! Session-scoped storage of command and event handlers (C3).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use crate::command::{Command, CommandResult};
use crate::error::BusError;
use crate::event::Event;
use crate::message::{SessionId, BUS_SESSION};

/// Canonical priority levels. Lower number runs first.
pub mod priority {
    pub const HIGHEST: i32 = 0;
    pub const HIGH: i32 = 10;
    pub const NORMAL: i32 = 50;
    pub const LOW: i32 = 90;
    pub const LOWEST: i32 = 100;
}

pub type CommandHandlerFn<C> = Arc<dyn Fn(C) -> BoxFuture<'static, CommandResult> + Send + Sync>;

/// What an event handler returns on failure. Handlers signal "threw" through
/// `Err`, the idiomatic equivalent of the source system's exception-on-handler
/// semantics (§4.3, §4.9 `EventHandlerFailedEvent`).
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type EventHandlerResult = Result<(), HandlerError>;
pub type EventHandlerFn<E> = Arc<dyn Fn(Arc<E>) -> BoxFuture<'static, EventHandlerResult> + Send + Sync>;

struct EventHandlerEntry {
    priority: i32,
    seq: u64,
    handler: Box<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct SessionHandlers {
    commands: HashMap<TypeId, (&'static str, Box<dyn Any + Send + Sync>)>,
    events: HashMap<TypeId, Vec<EventHandlerEntry>>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, SessionHandlers>,
    next_seq: u64,
}

/// Statistics surfaced via `registered_handlers` and debugging tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerStats {
    pub command_handlers: usize,
    pub event_handlers: usize,
}

/// Stores command and event handlers scoped by session, keyed internally by
/// the Rust `TypeId` of the concrete command/event type.
pub struct HandlerRegistry {
    inner: Mutex<Inner>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register the single handler for `(C, session_id)`. Fails if one already exists.
    pub fn register_command_handler<C, F, Fut>(
        &self,
        session_id: impl Into<SessionId>,
        handler: F,
    ) -> Result<(), BusError>
    where
        C: Command + 'static,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = CommandResult> + Send + 'static,
    {
        let session_id = session_id.into();
        let type_id = TypeId::of::<C>();
        let type_name = std::any::type_name::<C>();

        let mut inner = self.lock();
        let session = inner.sessions.entry(session_id.clone()).or_default();
        if session.commands.contains_key(&type_id) {
            return Err(BusError::HandlerAlreadyRegistered { command_type: type_name, session_id });
        }

        let erased: CommandHandlerFn<C> = Arc::new(move |c| Box::pin(handler(c)));
        let boxed: Box<dyn Any + Send + Sync> = Box::new(erased);
        session.commands.insert(type_id, (type_name, boxed));
        Ok(())
    }

    /// Session-first with BUS-scope fallback.
    pub fn get_command_handler<C: Command + 'static>(
        &self,
        session_id: &str,
    ) -> Option<CommandHandlerFn<C>> {
        let type_id = TypeId::of::<C>();
        let inner = self.lock();

        let direct = inner
            .sessions
            .get(session_id)
            .and_then(|s| s.commands.get(&type_id))
            .and_then(|(_, boxed)| boxed.downcast_ref::<CommandHandlerFn<C>>())
            .cloned();
        if direct.is_some() || session_id == BUS_SESSION {
            return direct;
        }
        inner
            .sessions
            .get(BUS_SESSION)
            .and_then(|s| s.commands.get(&type_id))
            .and_then(|(_, boxed)| boxed.downcast_ref::<CommandHandlerFn<C>>())
            .cloned()
    }

    /// Always appends; the list stays sorted by `(priority, registration order)`.
    pub fn register_event_handler<E, F, Fut>(
        &self,
        session_id: impl Into<SessionId>,
        priority: i32,
        handler: F,
    ) where
        E: Event + 'static,
        F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = EventHandlerResult> + Send + 'static,
    {
        let type_id = TypeId::of::<E>();
        let erased: EventHandlerFn<E> = Arc::new(move |e| Box::pin(handler(e)));
        let boxed: Box<dyn Any + Send + Sync> = Box::new(erased);

        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let session = inner.sessions.entry(session_id.into()).or_default();
        let entries = session.events.entry(type_id).or_default();
        entries.push(EventHandlerEntry { priority, seq, handler: boxed });
        entries.sort_by_key(|e| (e.priority, e.seq));
    }

    /// Union of session-scope and BUS-scope handlers, stably sorted by priority.
    pub fn get_event_handlers<E: Event + 'static>(&self, session_id: &str) -> Vec<EventHandlerFn<E>> {
        self.get_event_handlers_with_priority::<E>(session_id)
            .into_iter()
            .map(|(_, f)| f)
            .collect()
    }

    /// Same as [`get_event_handlers`](Self::get_event_handlers), but keeps each
    /// handler's registered priority alongside it — needed when reporting
    /// which handler failed (`EventHandlerFailedEvent::handler_priority`).
    pub fn get_event_handlers_with_priority<E: Event + 'static>(
        &self,
        session_id: &str,
    ) -> Vec<(i32, EventHandlerFn<E>)> {
        let type_id = TypeId::of::<E>();
        let inner = self.lock();

        let mut merged: Vec<(i32, u64, EventHandlerFn<E>)> = Vec::new();
        let mut push_from = |session: Option<&SessionHandlers>| {
            if let Some(session) = session {
                if let Some(entries) = session.events.get(&type_id) {
                    for entry in entries {
                        if let Some(f) = entry.handler.downcast_ref::<EventHandlerFn<E>>() {
                            merged.push((entry.priority, entry.seq, f.clone()));
                        }
                    }
                }
            }
        };
        push_from(inner.sessions.get(session_id));
        if session_id != BUS_SESSION {
            push_from(inner.sessions.get(BUS_SESSION));
        }
        merged.sort_by_key(|(priority, seq, _)| (*priority, *seq));
        merged.into_iter().map(|(priority, _, f)| (priority, f)).collect()
    }

    /// Remove every handler tied to `session_id`. The `BUS` scope cannot be
    /// removed; attempting to do so is a no-op (callers should log a warning).
    pub fn unregister_session(&self, session_id: &str) -> Result<(), BusError> {
        if session_id == BUS_SESSION {
            return Err(BusError::CannotUnregisterBusScope);
        }
        self.lock().sessions.remove(session_id);
        Ok(())
    }

    pub fn handler_stats(&self) -> HandlerStats {
        let inner = self.lock();
        let mut stats = HandlerStats::default();
        for session in inner.sessions.values() {
            stats.command_handlers += session.commands.len();
            stats.event_handlers += session.events.values().map(Vec::len).sum::<usize>();
        }
        stats
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
