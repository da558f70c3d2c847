//! The Journal: an append-only, execIndex-ordered replay log. Each
//! side-effecting primitive (activity call, sleep, signal wait, child
//! workflow, random draw) records exactly one entry per execIndex; replaying
//! a job re-reads the same entries in the same order instead of re-running
//! the side effect.
//!
//! Grounded on `persistence.rs`'s `PersistentMachine` contract: load before
//! decide, save before dispatch, skip if unchanged. An execIndex commits
//! exactly once via the same optimistic-concurrency CAS shape as
//! `MachineStore::save(id, state, expected_revision)`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::MemFlowError;

/// Position within a dimension's execution sequence. Dimensions branch at
/// `Promise.all`-style join points; each dimension keeps its own counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExecIndex(pub u64);

impl ExecIndex {
    pub const ZERO: ExecIndex = ExecIndex(0);

    pub fn next(self) -> ExecIndex {
        ExecIndex(self.0 + 1)
    }
}

/// A dimensional thread id (the "dad" string), e.g. `"0,1"` for the second
/// branch spawned at join point 0.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimension(pub String);

impl Dimension {
    pub fn root() -> Self {
        Dimension(",0".to_string())
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEntryKind {
    ActivityCall,
    /// A child workflow started and awaited to completion. Written once,
    /// on resumption, by `Engine::record_child_result` — carries the
    /// child's final result, not its start.
    ChildExec,
    /// A child workflow started fire-and-forget (`Engine::call_child_detached`),
    /// written immediately rather than on a later resumption.
    ChildStart,
    Sleep,
    /// A `waitFor` suspension point: recorded once the awaited signal has
    /// actually landed.
    WaitFor,
    /// A signal delivered to a job, independent of whether anything was
    /// waiting for it yet (signal-before-wait).
    Signal,
    Random,
    Trace,
    /// A value the workflow chose to surface as a side-channel event,
    /// distinct from its final result.
    Emit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub job_id: String,
    pub dimension: Dimension,
    pub exec_index: ExecIndex,
    pub kind: JournalEntryKind,
    pub payload: Value,
}

#[async_trait]
pub trait Journal: Send + Sync {
    /// The next unused execIndex for `(job_id, dimension)`. Does not itself
    /// advance anything durable — it is a read used to decide whether a
    /// lookup or a fresh append is needed.
    async fn next_exec_index(
        &self,
        job_id: &str,
        dimension: &Dimension,
    ) -> Result<ExecIndex, MemFlowError>;

    async fn load_entry(
        &self,
        job_id: &str,
        dimension: &Dimension,
        exec_index: ExecIndex,
    ) -> Result<Option<JournalEntry>, MemFlowError>;

    /// Append a new entry. Must fail rather than overwrite if an entry
    /// already exists at `(job_id, dimension, exec_index)` — replay
    /// determinism depends on an execIndex committing exactly once.
    async fn append_entry(&self, entry: JournalEntry) -> Result<(), MemFlowError>;
}

/// In-memory `Journal` for tests and the single-process deployment mode.
#[derive(Default)]
pub struct InMemoryJournal {
    entries: Mutex<HashMap<(String, String, u64), JournalEntry>>,
    cursors: Mutex<HashMap<(String, String), u64>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Journal for InMemoryJournal {
    async fn next_exec_index(
        &self,
        job_id: &str,
        dimension: &Dimension,
    ) -> Result<ExecIndex, MemFlowError> {
        let cursors = self.cursors.lock().expect("journal mutex poisoned");
        let next = cursors
            .get(&(job_id.to_string(), dimension.0.clone()))
            .copied()
            .unwrap_or(0);
        Ok(ExecIndex(next))
    }

    async fn load_entry(
        &self,
        job_id: &str,
        dimension: &Dimension,
        exec_index: ExecIndex,
    ) -> Result<Option<JournalEntry>, MemFlowError> {
        let entries = self.entries.lock().expect("journal mutex poisoned");
        Ok(entries
            .get(&(job_id.to_string(), dimension.0.clone(), exec_index.0))
            .cloned())
    }

    async fn append_entry(&self, entry: JournalEntry) -> Result<(), MemFlowError> {
        let key = (
            entry.job_id.clone(),
            entry.dimension.0.clone(),
            entry.exec_index.0,
        );
        let mut entries = self.entries.lock().expect("journal mutex poisoned");
        if entries.contains_key(&key) {
            return Err(MemFlowError::Collation(format!(
                "execIndex {} already committed for job {} dimension {}",
                entry.exec_index.0, entry.job_id, entry.dimension.0
            )));
        }
        entries.insert(key.clone(), entry);
        drop(entries);
        let mut cursors = self.cursors.lock().expect("journal mutex poisoned");
        let cursor_key = (key.0, key.1);
        let cursor = cursors.entry(cursor_key).or_insert(0);
        *cursor = (*cursor).max(key.2 + 1);
        Ok(())
    }
}
