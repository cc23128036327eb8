//! Bounded store of commands that exhausted retries (C7).
//!
//! The full original command can't be retained generically without making
//! every command type serializable or clonable into a type-erased store;
//! instead each entry carries a retry thunk — a boxed closure capturing the
//! original typed command — so [`DeadLetterStore::retry`] can resubmit it
//! through the normal execute path. This mirrors the closure-capturing idiom
//! already used for type-erased handlers in [`crate::registry`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::command::CommandResult;
use crate::message::Metadata;

/// A retry thunk: resubmits the captured command through the bus's execute path.
pub type RetryThunk = Arc<dyn Fn() -> BoxFuture<'static, CommandResult> + Send + Sync>;

#[derive(Clone)]
pub struct DeadLetterEntry {
    pub command_type: &'static str,
    pub command_id: String,
    pub error: String,
    pub attempts: u32,
    pub first_attempt: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
    pub metadata: Metadata,
    pub(crate) retry_thunk: RetryThunk,
}

impl std::fmt::Debug for DeadLetterEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterEntry")
            .field("command_type", &self.command_type)
            .field("command_id", &self.command_id)
            .field("error", &self.error)
            .field("attempts", &self.attempts)
            .field("first_attempt", &self.first_attempt)
            .field("last_attempt", &self.last_attempt)
            .finish()
    }
}

/// A bounded FIFO of [`DeadLetterEntry`]. When full, `put` drops the
/// newest-incoming entry and keeps the older forensic history, per §4.7:
/// "the most recent failure is lost rather than evicting older forensic data".
pub struct DeadLetterStore {
    capacity: usize,
    entries: Mutex<VecDeque<DeadLetterEntry>>,
}

impl DeadLetterStore {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: Mutex::new(VecDeque::new()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<DeadLetterEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Returns `true` if the entry was stored, `false` if the store was full
    /// and the entry was dropped.
    pub fn put(&self, entry: DeadLetterEntry) -> bool {
        let mut entries = self.lock();
        if entries.len() >= self.capacity {
            tracing::warn!(
                command_type = entry.command_type,
                command_id = %entry.command_id,
                "dead-letter store full, dropping newest entry"
            );
            return false;
        }
        entries.push_back(entry);
        true
    }

    /// Snapshot read without consuming; contents are preserved across the call.
    pub fn entries(&self, limit: Option<usize>) -> Vec<DeadLetterEntry> {
        let entries = self.lock();
        match limit {
            Some(n) => entries.iter().take(n).cloned().collect(),
            None => entries.iter().cloned().collect(),
        }
    }

    /// Locate an entry by command id, remove it, and return its retry thunk
    /// so the caller can resubmit it through the bus's normal execute path.
    pub fn take_for_retry(&self, command_id: &str) -> Option<(DeadLetterEntry, RetryThunk)> {
        let mut entries = self.lock();
        let pos = entries.iter().position(|e| e.command_id == command_id)?;
        let entry = entries.remove(pos)?;
        let thunk = entry.retry_thunk.clone();
        Some((entry, thunk))
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> DeadLetterEntry {
        DeadLetterEntry {
            command_type: "Add",
            command_id: id.to_string(),
            error: "boom".into(),
            attempts: 3,
            first_attempt: Utc::now(),
            last_attempt: Utc::now(),
            metadata: Metadata::new(),
            retry_thunk: Arc::new(|| Box::pin(async { CommandResult::ok("retried", serde_json::json!(null)) })),
        }
    }

    #[test]
    fn put_and_read_preserves_contents() {
        let store = DeadLetterStore::new(10);
        store.put(entry("1"));
        store.put(entry("2"));
        assert_eq!(store.size(), 2);
        let snapshot = store.entries(None);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(store.size(), 2);
    }

    #[test]
    fn full_store_drops_newest_entry() {
        let store = DeadLetterStore::new(1);
        assert!(store.put(entry("1")));
        assert!(!store.put(entry("2")));
        assert_eq!(store.size(), 1);
        assert_eq!(store.entries(None)[0].command_id, "1");
    }

    #[tokio::test]
    async fn retry_removes_entry_and_returns_thunk() {
        let store = DeadLetterStore::new(10);
        store.put(entry("1"));
        let (removed, thunk) = store.take_for_retry("1").unwrap();
        assert_eq!(removed.command_id, "1");
        assert_eq!(store.size(), 0);
        let result = thunk().await;
        assert!(result.success);
    }

    #[test]
    fn retry_on_missing_id_returns_none() {
        let store = DeadLetterStore::new(10);
        assert!(store.take_for_retry("missing").is_none());
    }
}
