//! Base message model shared by commands and events.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Reserved session scope. Handlers registered here are visible to every
/// session: as a fallback for commands, unioned in for events.
pub const BUS_SESSION: &str = "BUS";

/// Opaque message identifier.
pub type MessageId = Uuid;

/// A session scope identifier. Cheap to clone; sessions pass this around by value.
pub type SessionId = String;

/// A string-keyed map to a closed set of value kinds.
///
/// The source system allows arbitrary values in metadata; here the value
/// space is a small sum type instead, per the rewrite's typed-metadata design note.
pub type Metadata = HashMap<String, MetadataValue>;

/// The closed value type stored in [`Metadata`].
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Str(String),
    Num(f64),
    Bool(bool),
    Array(Vec<MetadataValue>),
    Map(Metadata),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetadataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            MetadataValue::Num(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Str(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Str(s)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

impl From<f64> for MetadataValue {
    fn from(n: f64) -> Self {
        MetadataValue::Num(n)
    }
}

impl From<usize> for MetadataValue {
    fn from(n: usize) -> Self {
        MetadataValue::Num(n as f64)
    }
}

/// Fields shared by every command and event. Handlers never mutate these.
#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub message_id: MessageId,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub metadata: Metadata,
}

impl MessageMeta {
    /// A fresh meta block scoped to the bus-wide session.
    pub fn new() -> Self {
        Self::for_session(BUS_SESSION.to_string())
    }

    pub fn for_session(session_id: SessionId) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            session_id,
            created_at: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

impl Default for MessageMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Common accessors every message (command or event) exposes.
pub trait Message: fmt::Debug + Send + Sync {
    fn message_id(&self) -> MessageId;
    fn session_id(&self) -> &str;
    fn created_at(&self) -> DateTime<Utc>;
    fn metadata(&self) -> &Metadata;
}

/// Implements [`Message`] for a type that embeds a `meta: MessageMeta` field,
/// the way every built-in command and event type in this crate does.
macro_rules! impl_message_via_meta {
    ($ty:ty) => {
        impl $crate::message::Message for $ty {
            fn message_id(&self) -> $crate::message::MessageId {
                self.meta.message_id
            }
            fn session_id(&self) -> &str {
                &self.meta.session_id
            }
            fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                self.meta.created_at
            }
            fn metadata(&self) -> &$crate::message::Metadata {
                &self.meta.metadata
            }
        }
    };
}

pub(crate) use impl_message_via_meta;
