//! Publish-time filters: predicates evaluated before an event reaches the
//! queue. A `false` verdict from any registered filter silently drops the
//! event (§4.4, §7 `FilteredOut`).

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::event::Event;

/// A publish-time predicate over `(event, session_id)`.
pub trait EventFilter: Send + Sync {
    fn allow(&self, event: &dyn Event, session_id: &str, event_type: &'static str) -> bool;
}

/// Include/exclude by session id. An empty `include` means "all sessions unless excluded".
#[derive(Debug, Default, Clone)]
pub struct SessionFilter {
    pub include: HashSet<String>,
    pub exclude: HashSet<String>,
}

impl EventFilter for SessionFilter {
    fn allow(&self, _event: &dyn Event, session_id: &str, _event_type: &'static str) -> bool {
        if self.exclude.contains(session_id) {
            return false;
        }
        self.include.is_empty() || self.include.contains(session_id)
    }
}

/// Include/exclude by event type name.
#[derive(Debug, Default, Clone)]
pub struct EventTypeFilter {
    pub include: HashSet<&'static str>,
    pub exclude: HashSet<&'static str>,
}

impl EventFilter for EventTypeFilter {
    fn allow(&self, _event: &dyn Event, _session_id: &str, event_type: &'static str) -> bool {
        if self.exclude.contains(event_type) {
            return false;
        }
        self.include.is_empty() || self.include.contains(event_type)
    }
}

/// Glob-style (`*`, `?`) include/exclude matching against the event type's name.
#[derive(Debug, Clone)]
pub struct PatternFilter {
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub case_sensitive: bool,
}

impl PatternFilter {
    fn matches(&self, pattern: &str, text: &str) -> bool {
        let (pattern, text) = if self.case_sensitive {
            (pattern.to_string(), text.to_string())
        } else {
            (pattern.to_lowercase(), text.to_lowercase())
        };
        glob_match(&pattern, &text)
    }
}

impl EventFilter for PatternFilter {
    fn allow(&self, _event: &dyn Event, _session_id: &str, event_type: &'static str) -> bool {
        if self.exclude_patterns.iter().any(|p| self.matches(p, event_type)) {
            return false;
        }
        self.include_patterns.is_empty() || self.include_patterns.iter().any(|p| self.matches(p, event_type))
    }
}

/// Minimal `*`/`?` glob matcher, sufficient for event type name patterns.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    glob_match_inner(&pattern, &text)
}

fn glob_match_inner(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            glob_match_inner(&pattern[1..], text)
                || (!text.is_empty() && glob_match_inner(pattern, &text[1..]))
        }
        Some('?') => !text.is_empty() && glob_match_inner(&pattern[1..], &text[1..]),
        Some(c) => text.first() == Some(c) && glob_match_inner(&pattern[1..], &text[1..]),
    }
}

/// Require a set of metadata keys to be present, and (optionally) to hold
/// specific string values.
#[derive(Debug, Default, Clone)]
pub struct MetadataFilter {
    pub required_keys: Vec<String>,
    pub required_values: Vec<(String, String)>,
}

impl EventFilter for MetadataFilter {
    fn allow(&self, event: &dyn Event, _session_id: &str, _event_type: &'static str) -> bool {
        let metadata = event.metadata();
        if !self.required_keys.iter().all(|k| metadata.contains_key(k)) {
            return false;
        }
        self.required_values
            .iter()
            .all(|(k, v)| metadata.get(k).and_then(|mv| mv.as_str()) == Some(v.as_str()))
    }
}

/// Token-bucket-free sliding counter rate limit, partitioned by session
/// and/or event type per the spec's `per_session`/`per_type` flags.
pub struct RateLimitFilter {
    max_per_second: f64,
    per_session: bool,
    per_type: bool,
    windows: Mutex<std::collections::HashMap<String, (Instant, u32)>>,
}

impl RateLimitFilter {
    pub fn new(max_per_second: f64, per_session: bool, per_type: bool) -> Self {
        Self { max_per_second, per_session, per_type, windows: Mutex::new(std::collections::HashMap::new()) }
    }

    fn key(&self, session_id: &str, event_type: &'static str) -> String {
        match (self.per_session, self.per_type) {
            (true, true) => format!("{session_id}:{event_type}"),
            (true, false) => session_id.to_string(),
            (false, true) => event_type.to_string(),
            (false, false) => "*".to_string(),
        }
    }
}

impl EventFilter for RateLimitFilter {
    fn allow(&self, _event: &dyn Event, session_id: &str, event_type: &'static str) -> bool {
        let key = self.key(session_id, event_type);
        let mut windows = self.windows.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let entry = windows.entry(key).or_insert((now, 0));
        if now.duration_since(entry.0) >= Duration::from_secs(1) {
            *entry = (now, 0);
        }
        if (entry.1 as f64) < self.max_per_second {
            entry.1 += 1;
            true
        } else {
            false
        }
    }
}

/// Combine filters with AND (`require_all = true`) or OR (`require_all = false`).
pub struct CompositeFilter {
    pub filters: Vec<Box<dyn EventFilter>>,
    pub require_all: bool,
}

impl EventFilter for CompositeFilter {
    fn allow(&self, event: &dyn Event, session_id: &str, event_type: &'static str) -> bool {
        if self.require_all {
            self.filters.iter().all(|f| f.allow(event, session_id, event_type))
        } else {
            self.filters.is_empty() || self.filters.iter().any(|f| f.allow(event, session_id, event_type))
        }
    }
}

/// Logs every event it sees and always allows it through; useful for
/// diagnosing why an event did or didn't make it to the queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct DebugFilter;

impl EventFilter for DebugFilter {
    fn allow(&self, _event: &dyn Event, session_id: &str, event_type: &'static str) -> bool {
        tracing::debug!(session_id, event_type, "debug_filter: event observed");
        true
    }
}
