//! Events tagged with a future wall-clock fire time (C9).
//!
//! The dispatch loop (`crate::bus`) must never deliver a scheduled event
//! before its fire time; the mechanism it uses is "put back onto the queue
//! on early dequeue" (§4.9), backed by
//! [`BoundedEventQueue::drain_matching`](crate::queue::BoundedEventQueue::drain_matching).
//!
//! Rather than a generic wrapper around an arbitrary `Event` (which would
//! make persisting "every scheduled event still pending at shutdown"
//! type-erasure-proof without forcing `Event: Serialize` onto every message
//! type), `ScheduledEvent` is one concrete type carrying an opaque JSON
//! payload plus a type tag. Producers serialize their payload at `publish`
//! time and deserialize it back out in their handler — this is the
//! representation choice SPEC_FULL.md calls for in §4.9.

use std::any::Any;

use chrono::{DateTime, Utc};

use crate::event::Event;
use crate::message::{impl_message_via_meta, Message, MessageMeta};

/// A notification scheduled to fire at `fire_at`. Subscribed to like any
/// other event type (`bus.register_event_handler::<ScheduledEvent>(...)`);
/// handlers dispatch on `payload_type` and deserialize `payload` themselves.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub meta: MessageMeta,
    pub payload_type: String,
    pub payload: serde_json::Value,
    pub fire_at: DateTime<Utc>,
}

impl ScheduledEvent {
    pub fn new(
        session_id: impl Into<String>,
        payload_type: impl Into<String>,
        payload: serde_json::Value,
        fire_at: DateTime<Utc>,
    ) -> Self {
        Self { meta: MessageMeta::for_session(session_id.into()), payload_type: payload_type.into(), payload, fire_at }
    }

    pub fn is_due(&self) -> bool {
        Utc::now() >= self.fire_at
    }
}

impl_message_via_meta!(ScheduledEvent);
impl Event for ScheduledEvent {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn scheduled_time(&self) -> Option<DateTime<Utc>> {
        Some(self.fire_at)
    }
}

/// External collaborator: durable save/restore for scheduled events still
/// pending at shutdown/start. The bus only defines the interface; storage
/// format and durability guarantees belong to the implementation (§6).
pub trait ScheduledEventStore: Send + Sync {
    /// Called during `stop` with every scheduled event still pending.
    fn save_unfinished_events(&self, events: Vec<ScheduledEvent>);

    /// Called during `start`; returns scheduled events to re-enqueue.
    fn load_unfinished_events(&self) -> Vec<ScheduledEvent>;
}

/// Default store: drops everything on save, returns nothing on load.
/// Matches the Non-goal that ordinary events are ephemeral — a bus
/// constructed without an explicit store has no durability at all, scheduled
/// events included, until the caller supplies a real [`ScheduledEventStore`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NullScheduledEventStore;

impl ScheduledEventStore for NullScheduledEventStore {
    fn save_unfinished_events(&self, events: Vec<ScheduledEvent>) {
        if !events.is_empty() {
            tracing::debug!(count = events.len(), "no scheduled-event store configured, discarding");
        }
    }

    fn load_unfinished_events(&self) -> Vec<ScheduledEvent> {
        Vec::new()
    }
}

/// Also useful in tests: stores events in a plain in-memory vec across a
/// simulated restart (saves on `stop`, hands them back on the next `start`).
#[derive(Default)]
pub struct InMemoryScheduledEventStore {
    saved: std::sync::Mutex<Vec<ScheduledEvent>>,
}

impl InMemoryScheduledEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScheduledEventStore for InMemoryScheduledEventStore {
    fn save_unfinished_events(&self, events: Vec<ScheduledEvent>) {
        *self.saved.lock().unwrap_or_else(|p| p.into_inner()) = events;
    }

    fn load_unfinished_events(&self) -> Vec<ScheduledEvent> {
        std::mem::take(&mut *self.saved.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduled_event_reports_future_fire_time() {
        let fire_at = Utc::now() + chrono::Duration::seconds(60);
        let ev = ScheduledEvent::new("s1", "Reminder", serde_json::json!({"text": "stand up"}), fire_at);
        assert!(!ev.is_due());
        assert_eq!(ev.scheduled_time(), Some(fire_at));
    }

    #[test]
    fn scheduled_event_due_in_the_past_is_due() {
        let fire_at = Utc::now() - chrono::Duration::seconds(1);
        let ev = ScheduledEvent::new("s1", "Reminder", serde_json::json!(null), fire_at);
        assert!(ev.is_due());
    }

    #[test]
    fn in_memory_store_round_trips_across_restart() {
        let store = InMemoryScheduledEventStore::new();
        let ev = ScheduledEvent::new("s1", "Reminder", serde_json::json!(null), Utc::now() + chrono::Duration::seconds(30));
        store.save_unfinished_events(vec![ev]);
        let restored = store.load_unfinished_events();
        assert_eq!(restored.len(), 1);
        assert!(store.load_unfinished_events().is_empty());
    }
}
