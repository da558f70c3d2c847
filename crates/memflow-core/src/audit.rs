//! Debug-only stream-traffic auditing for development visibility.
//!
//! Tracks, per [`Router`](crate::router::Router) tick, which streams were
//! polled and whether anything handled what came off them. Zero production
//! cost: callers gate recording behind `#[cfg(debug_assertions)]`.
//!
//! # Usage
//!
//! ```ignore
//! #[cfg(debug_assertions)]
//! {
//!     for entry in audit_log.silent_ticks() {
//!         tracing::warn!(stream = entry.stream_name, "router tick observed nothing");
//!     }
//! }
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Maximum number of audit entries to retain.
const MAX_AUDIT_ENTRIES: usize = 1000;

/// One Router consume-dispatch-ack cycle against one stream.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub stream_name: String,
    /// Message ids claimed this tick.
    pub observed: Vec<i64>,
    /// Message ids that were handled and acked this tick.
    pub emitted: Vec<i64>,
    pub had_effect: bool,
}

impl AuditEntry {
    /// True when messages were claimed but none were acked (every handler
    /// failed or every result was silently dropped).
    pub fn was_silent(&self) -> bool {
        self.emitted.is_empty()
    }

    pub fn observed_but_silent(&self) -> bool {
        !self.observed.is_empty() && self.emitted.is_empty()
    }
}

/// Thread-safe ring buffer of recent [`AuditEntry`] values, bounded to
/// `MAX_AUDIT_ENTRIES` so a long-running router never grows this unbounded.
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(MAX_AUDIT_ENTRIES)),
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, entry: AuditEntry) {
        let mut entries = self.lock_entries();
        if entries.len() >= MAX_AUDIT_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock_entries().iter().cloned().collect()
    }

    pub fn recent(&self, n: usize) -> Vec<AuditEntry> {
        self.lock_entries().iter().rev().take(n).cloned().collect()
    }

    pub fn silent_ticks(&self) -> Vec<AuditEntry> {
        self.lock_entries().iter().filter(|e| e.was_silent()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    pub fn stats(&self) -> AuditStats {
        let entries = self.lock_entries();
        let total = entries.len();
        let silent = entries.iter().filter(|e| e.was_silent()).count();
        let with_effect = entries.iter().filter(|e| e.had_effect).count();
        AuditStats {
            total_ticks: total,
            silent_ticks: silent,
            ticks_with_effect: with_effect,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AuditStats {
    pub total_ticks: usize,
    pub silent_ticks: usize,
    pub ticks_with_effect: usize,
}

/// Builder used by a Router tick to accumulate observed/emitted ids before
/// recording the entry.
#[derive(Debug)]
pub struct AuditEntryBuilder {
    stream_name: String,
    observed: Vec<i64>,
    emitted: Vec<i64>,
}

impl AuditEntryBuilder {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            observed: Vec::new(),
            emitted: Vec::new(),
        }
    }

    pub fn observed(&mut self, message_id: i64) {
        self.observed.push(message_id);
    }

    pub fn emitted(&mut self, message_id: i64) {
        self.emitted.push(message_id);
    }

    pub fn build(self) -> AuditEntry {
        AuditEntry {
            stream_name: self.stream_name,
            observed: self.observed,
            had_effect: !self.emitted.is_empty(),
            emitted: self.emitted,
        }
    }
}

pub type SharedAuditLog = Arc<AuditLog>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_tick_is_observed_but_not_emitted() {
        let mut builder = AuditEntryBuilder::new("ns.q:worker");
        builder.observed(1);
        builder.observed(2);
        let entry = builder.build();

        assert!(entry.was_silent());
        assert!(entry.observed_but_silent());
    }

    #[test]
    fn tick_with_effect_is_not_silent() {
        let mut builder = AuditEntryBuilder::new("ns.q:worker");
        builder.observed(1);
        builder.emitted(1);
        let entry = builder.build();

        assert!(!entry.was_silent());
        assert!(!entry.observed_but_silent());
    }

    #[test]
    fn log_bounds_entries_to_capacity() {
        let log = AuditLog::new();
        for _ in 0..MAX_AUDIT_ENTRIES + 50 {
            log.record(AuditEntryBuilder::new("ns.q:engine").build());
        }
        assert_eq!(log.len(), MAX_AUDIT_ENTRIES);
    }

    #[test]
    fn stats_count_silent_and_effectful_ticks() {
        let log = AuditLog::new();

        let mut silent = AuditEntryBuilder::new("ns.q:worker");
        silent.observed(1);
        log.record(silent.build());

        let mut effectful = AuditEntryBuilder::new("ns.q:engine");
        effectful.observed(2);
        effectful.emitted(2);
        log.record(effectful.build());

        let stats = log.stats();
        assert_eq!(stats.total_ticks, 2);
        assert_eq!(stats.silent_ticks, 1);
        assert_eq!(stats.ticks_with_effect, 1);
    }

    #[test]
    fn recent_returns_most_recent_first() {
        let log = AuditLog::new();
        for i in 0..5 {
            let mut builder = AuditEntryBuilder::new(format!("stream-{i}"));
            if i >= 3 {
                builder.emitted(i);
            }
            log.record(builder.build());
        }
        let recent = log.recent(2);
        assert_eq!(recent.len(), 2);
        assert!(recent[0].had_effect);
        assert_eq!(recent[0].stream_name, "stream-4");
    }
}
