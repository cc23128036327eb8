//! The event side of the message model: broadcast notifications with zero or
//! more handlers and no result, plus the built-in event types the dispatch
//! core itself publishes.

use std::any::Any;

use chrono::{DateTime, Utc};

use crate::command::CommandResult;
use crate::message::{impl_message_via_meta, Message, MessageMeta};

/// A broadcast notification. Zero or more handlers may be registered per
/// `(event type, session)`.
///
/// Unlike [`Command`](crate::command::Command), events are shared with every
/// matching handler rather than consumed by one, so the dispatch core hands
/// each handler an `Arc<E>` rather than an owned value — this is why `Event`
/// does not require `Clone`.
pub trait Event: Message + Any {
    fn as_any(&self) -> &dyn Any;

    /// `Some(t)` marks the event as a [`ScheduledEvent`](crate::scheduled::ScheduledEvent)
    /// whose delivery the dispatch loop must defer until `t`. Ordinary events return `None`.
    fn scheduled_time(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Emitted before a command handler runs. Fire-and-forget: publishing it
/// never blocks `execute` on processing.
#[derive(Debug, Clone)]
pub struct CommandStartedEvent {
    pub meta: MessageMeta,
    pub command_type: &'static str,
    pub command_id: String,
}

impl_message_via_meta!(CommandStartedEvent);
impl Event for CommandStartedEvent {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Emitted after a command handler reaches a terminal state, carrying the result.
#[derive(Debug, Clone)]
pub struct CommandResultEvent {
    pub meta: MessageMeta,
    pub command_type: &'static str,
    pub result: CommandResult,
}

impl_message_via_meta!(CommandResultEvent);
impl Event for CommandResultEvent {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Published when a [`Session`](crate::session::Session) becomes active.
#[derive(Debug, Clone)]
pub struct SessionStartEvent {
    pub meta: MessageMeta,
}

impl_message_via_meta!(SessionStartEvent);
impl Event for SessionStartEvent {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Published when a [`Session`](crate::session::Session) ends, for any reason.
#[derive(Debug, Clone)]
pub struct SessionEndEvent {
    pub meta: MessageMeta,
    pub duration: std::time::Duration,
    pub error: Option<String>,
}

impl_message_via_meta!(SessionEndEvent);
impl Event for SessionEndEvent {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Published when an event handler errors and error-suppression is enabled.
#[derive(Debug, Clone)]
pub struct EventHandlerFailedEvent {
    pub meta: MessageMeta,
    pub event_type: &'static str,
    pub event_id: crate::message::MessageId,
    pub handler_priority: i32,
    pub error: String,
}

impl_message_via_meta!(EventHandlerFailedEvent);
impl Event for EventHandlerFailedEvent {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Published whenever an entry is pushed to the dead-letter store.
///
/// A dedicated typed event rather than a generic event with a string marker
/// in its metadata, per this repository's typed-metadata design preference.
#[derive(Debug, Clone)]
pub struct DeadLetterAddedEvent {
    pub meta: MessageMeta,
    pub command_type: &'static str,
    pub command_id: String,
    pub attempts: u32,
    pub error: String,
}

impl_message_via_meta!(DeadLetterAddedEvent);
impl Event for DeadLetterAddedEvent {
    fn as_any(&self) -> &dyn Any {
        self
    }
}
