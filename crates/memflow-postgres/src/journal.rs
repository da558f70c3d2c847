//! Postgres-backed [`memflow::Journal`].
//!
//! One row per `(job_id, dimension, exec_index)` in `{namespace}.journal_entries`,
//! with the primary key itself enforcing the "commits exactly once" rule —
//! a duplicate insert is caught and reported as [`MemFlowError::Collation`]
//! the same way `InMemoryJournal` reports it, rather than surfacing a raw
//! unique-violation error across the boundary.

use async_trait::async_trait;
use memflow::{Dimension, ExecIndex, Journal, JournalEntry, JournalEntryKind, MemFlowError};
use sqlx::{PgPool, Row};

#[derive(Clone)]
pub struct PgJournal {
    pool: PgPool,
    namespace: String,
}

impl PgJournal {
    pub fn new(pool: PgPool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
        }
    }
}

fn kind_to_str(kind: JournalEntryKind) -> &'static str {
    match kind {
        JournalEntryKind::ActivityCall => "activity_call",
        JournalEntryKind::ChildExec => "child_exec",
        JournalEntryKind::ChildStart => "child_start",
        JournalEntryKind::Sleep => "sleep",
        JournalEntryKind::WaitFor => "wait_for",
        JournalEntryKind::Signal => "signal",
        JournalEntryKind::Random => "random",
        JournalEntryKind::Trace => "trace",
        JournalEntryKind::Emit => "emit",
    }
}

fn kind_from_str(s: &str) -> Result<JournalEntryKind, MemFlowError> {
    Ok(match s {
        "activity_call" => JournalEntryKind::ActivityCall,
        "child_exec" => JournalEntryKind::ChildExec,
        "child_start" => JournalEntryKind::ChildStart,
        "sleep" => JournalEntryKind::Sleep,
        "wait_for" => JournalEntryKind::WaitFor,
        "signal" => JournalEntryKind::Signal,
        "random" => JournalEntryKind::Random,
        "trace" => JournalEntryKind::Trace,
        "emit" => JournalEntryKind::Emit,
        other => {
            return Err(MemFlowError::Backend(anyhow::anyhow!(
                "unrecognized journal entry kind: {other}"
            )))
        }
    })
}

#[async_trait]
impl Journal for PgJournal {
    async fn next_exec_index(&self, job_id: &str, dimension: &Dimension) -> Result<ExecIndex, MemFlowError> {
        let row = sqlx::query(&format!(
            "SELECT COALESCE(MAX(exec_index), -1) AS max_index FROM {}.journal_entries
             WHERE job_id = $1 AND dimension = $2",
            self.namespace
        ))
        .bind(job_id)
        .bind(&dimension.0)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| MemFlowError::Backend(e.into()))?;
        let max_index: i64 = row.get("max_index");
        Ok(ExecIndex((max_index + 1) as u64))
    }

    async fn load_entry(
        &self,
        job_id: &str,
        dimension: &Dimension,
        exec_index: ExecIndex,
    ) -> Result<Option<JournalEntry>, MemFlowError> {
        let row = sqlx::query(&format!(
            "SELECT kind, payload FROM {}.journal_entries
             WHERE job_id = $1 AND dimension = $2 AND exec_index = $3",
            self.namespace
        ))
        .bind(job_id)
        .bind(&dimension.0)
        .bind(exec_index.0 as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MemFlowError::Backend(e.into()))?;

        match row {
            None => Ok(None),
            Some(row) => {
                let kind_str: String = row.get("kind");
                let payload_str: String = row.get("payload");
                Ok(Some(JournalEntry {
                    job_id: job_id.to_string(),
                    dimension: dimension.clone(),
                    exec_index,
                    kind: kind_from_str(&kind_str)?,
                    payload: serde_json::from_str(&payload_str).map_err(|e| MemFlowError::Backend(e.into()))?,
                }))
            }
        }
    }

    async fn append_entry(&self, entry: JournalEntry) -> Result<(), MemFlowError> {
        let payload =
            serde_json::to_string(&entry.payload).map_err(|e| MemFlowError::Backend(e.into()))?;
        let result = sqlx::query(&format!(
            "INSERT INTO {}.journal_entries (job_id, dimension, exec_index, kind, payload)
             VALUES ($1, $2, $3, $4, $5)",
            self.namespace
        ))
        .bind(&entry.job_id)
        .bind(&entry.dimension.0)
        .bind(entry.exec_index.0 as i64)
        .bind(kind_to_str(entry.kind))
        .bind(payload)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(MemFlowError::Collation(format!(
                    "duplicate journal entry for job {} dimension {} index {}",
                    entry.job_id, entry.dimension.0, entry.exec_index.0
                )))
            }
            Err(e) => Err(MemFlowError::Backend(e.into())),
        }
    }
}
