//! The command side of the message model: point-to-point requests with a result.

use std::any::Any;

use crate::message::{Message, Metadata, MetadataValue};

/// A point-to-point request. Exactly one handler may be registered per
/// `(command type, session)` pair.
///
/// `Command` is kept deliberately small: routing and circuit-breaker keying
/// use `TypeId`, obtained through [`Any`], rather than a string tag. This
/// keeps the registry closed over a known set of Rust types instead of an
/// open-world string namespace.
pub trait Command: Message + Any {
    fn as_any(&self) -> &dyn Any;
}

/// The outcome of executing a command. Never constructed to signal an error
/// to the caller of `execute` — the bus always returns one of these, with
/// `success = false` standing in for anything that would otherwise be an
/// exception.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub success: bool,
    pub command_id: String,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub metadata: Metadata,
}

impl CommandResult {
    pub fn ok(command_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            success: true,
            command_id: command_id.into(),
            result: Some(result),
            error: None,
            metadata: Metadata::new(),
        }
    }

    pub fn err(command_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            command_id: command_id.into(),
            result: None,
            error: Some(error.into()),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// True once a `RetriesExhausted` failure has been pushed to the dead-letter store.
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self.metadata.get("dead_letter"), Some(MetadataValue::Bool(true)))
    }
}
