//! The observability sink: an external collaborator invoked synchronously
//! from `publish` before an event reaches the queue (§6). A sink's own
//! errors must never propagate into the bus; built-in sinks here can't fail,
//! but [`Bus::publish`](crate::bus::Bus::publish) guards the call anyway.

use std::sync::{Arc, Mutex};

use crate::event::Event;

/// Single operation: observe an event as it is published. The sink is
/// optional on the bus; absence disables observation entirely.
pub trait ObservabilitySink: Send + Sync {
    fn observe_event(&self, event: &dyn Event, session_id: &str, event_type: &'static str);
}

/// Discards every observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ObservabilitySink for NullSink {
    fn observe_event(&self, _event: &dyn Event, _session_id: &str, _event_type: &'static str) {}
}

/// Logs every observation via `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ObservabilitySink for LogSink {
    fn observe_event(&self, _event: &dyn Event, session_id: &str, event_type: &'static str) {
        tracing::debug!(session_id, event_type, "observability: event published");
    }
}

/// Records every observed event type/session pair in memory; useful in tests
/// and for the console/file-writer style collaborators this crate treats as
/// out of scope (§1) but still needs a simple built-in stand-in for.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    observed: Arc<Mutex<Vec<(String, &'static str)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observed(&self) -> Vec<(String, &'static str)> {
        self.observed.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl ObservabilitySink for MemorySink {
    fn observe_event(&self, _event: &dyn Event, session_id: &str, event_type: &'static str) {
        self.observed.lock().unwrap_or_else(|p| p.into_inner()).push((session_id.to_string(), event_type));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{impl_message_via_meta, MessageMeta};
    use std::any::Any;

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

    #[test]
    fn memory_sink_records_observations() {
        let sink = MemorySink::new();
        let ev = Ping { meta: MessageMeta::for_session("s1".into()) };
        sink.observe_event(&ev, "s1", "Ping");
        assert_eq!(sink.observed(), vec![("s1".to_string(), "Ping")]);
    }
}
