//! The Collator: dimensional thread IDs, leg-completion notarization, and
//! duplicate-redelivery detection.
//!
//! Grounded on the Journal/Store optimistic-concurrency shape plus
//! `error.rs`'s pattern of a narrow, explicit error enum scoped to one
//! subsystem. `CollationError`/`GenerationalError` are deliberately *not*
//! retried — per the testable properties, a collation or generational
//! conflict means the triggering stream message is a duplicate or stale
//! redelivery, so the Router swallows it silently rather than escalating.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::MemFlowError;
use crate::journal::{Dimension, ExecIndex, Journal, JournalEntry, JournalEntryKind};

/// Reference to a specific activity-call leg being notarized.
#[derive(Debug, Clone)]
pub struct LegRef {
    pub job_id: String,
    pub dimension: Dimension,
    pub exec_index: ExecIndex,
}

pub struct Collator<J: Journal> {
    journal: Arc<J>,
    /// Re-entry counters keyed by `(job_id, originating dimension)`, used
    /// by `resolve_reentry_dimension` to mint a distinct child thread for
    /// each cycle pass through the same ancestor dimension.
    reentries: Mutex<HashMap<(String, String), u64>>,
}

impl<J: Journal> Collator<J> {
    pub fn new(journal: Arc<J>) -> Self {
        Self {
            journal,
            reentries: Mutex::new(HashMap::new()),
        }
    }

    /// Record that leg 1 (the dispatch-and-suspend half of an activity call)
    /// has committed. Returns `MemFlowError::Collation` if this leg was
    /// already notarized — the caller should treat that as a silent
    /// duplicate, not an error to propagate.
    pub async fn notarize_leg1_completion(
        &self,
        leg: &LegRef,
        kind: JournalEntryKind,
        payload: serde_json::Value,
    ) -> Result<(), MemFlowError> {
        if self
            .journal
            .load_entry(&leg.job_id, &leg.dimension, leg.exec_index)
            .await?
            .is_some()
        {
            return Err(MemFlowError::Collation(format!(
                "leg1 for job {} dimension {} execIndex {} already notarized",
                leg.job_id, leg.dimension, leg.exec_index.0
            )));
        }
        self.journal
            .append_entry(JournalEntry {
                job_id: leg.job_id.clone(),
                dimension: leg.dimension.clone(),
                exec_index: leg.exec_index,
                kind,
                payload,
            })
            .await
    }

    /// Mint a new dimension when a cycle re-enters an ancestor dimension —
    /// e.g. a workflow loop that calls back into a join point it has
    /// already passed through once. Each pass through `originating` for a
    /// given job gets a distinct child thread (`originating,N` for the
    /// Nth re-entry), so its execIndex counter never collides with the
    /// entries the previous pass already committed.
    pub fn resolve_reentry_dimension(&self, job_id: &str, originating: &Dimension) -> Dimension {
        let mut reentries = self.reentries.lock().expect("collator mutex poisoned");
        let count = reentries
            .entry((job_id.to_string(), originating.0.clone()))
            .or_insert(0);
        *count += 1;
        Dimension(format!("{},{}", originating.0, count))
    }

    /// True if `exec_index` has already been committed on `dimension` — the
    /// duplicate-detection check the Router runs before acting on a
    /// worker-reply message, so replays of the same completion are ignored.
    pub async fn is_duplicate(
        &self,
        job_id: &str,
        dimension: &Dimension,
        exec_index: ExecIndex,
    ) -> Result<bool, MemFlowError> {
        Ok(self
            .journal
            .load_entry(job_id, dimension, exec_index)
            .await?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::InMemoryJournal;

    #[tokio::test]
    async fn double_notarization_is_a_silent_collation_conflict() {
        let journal = Arc::new(InMemoryJournal::new());
        let collator = Collator::new(journal);
        let leg = LegRef {
            job_id: "job-1".into(),
            dimension: Dimension::root(),
            exec_index: ExecIndex::ZERO,
        };
        collator
            .notarize_leg1_completion(&leg, JournalEntryKind::ActivityCall, serde_json::Value::Null)
            .await
            .unwrap();

        let err = collator
            .notarize_leg1_completion(&leg, JournalEntryKind::ActivityCall, serde_json::Value::Null)
            .await;
        let err = err.unwrap_err();
        assert!(err.is_silent());
    }

    #[test]
    fn resolve_reentry_dimension_mints_distinct_threads_per_cycle_pass() {
        let journal = Arc::new(InMemoryJournal::new());
        let collator = Collator::new(journal);
        let root = Dimension::root();

        let first = collator.resolve_reentry_dimension("job-1", &root);
        let second = collator.resolve_reentry_dimension("job-1", &root);
        assert_ne!(first.0, second.0);
        assert_eq!(first.0, format!("{},1", root.0));
        assert_eq!(second.0, format!("{},2", root.0));

        // A different job re-entering the same ancestor dimension gets its
        // own counter, not a cross-job collision.
        let other_job_first = collator.resolve_reentry_dimension("job-2", &root);
        assert_eq!(other_job_first.0, format!("{},1", root.0));
    }

    #[tokio::test]
    async fn duplicate_check_reflects_journal_state() {
        let journal = Arc::new(InMemoryJournal::new());
        let collator = Collator::new(journal);
        let dim = Dimension::root();
        assert!(!collator
            .is_duplicate("job-1", &dim, ExecIndex::ZERO)
            .await
            .unwrap());

        let leg = LegRef {
            job_id: "job-1".into(),
            dimension: dim.clone(),
            exec_index: ExecIndex::ZERO,
        };
        collator
            .notarize_leg1_completion(&leg, JournalEntryKind::Sleep, serde_json::Value::Null)
            .await
            .unwrap();
        assert!(collator
            .is_duplicate("job-1", &dim, ExecIndex::ZERO)
            .await
            .unwrap());
    }
}
