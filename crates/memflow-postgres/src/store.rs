//! Postgres-backed [`memflow::Store`].
//!
//! Every `StoreKey` is `(namespace, appId, jobId, field)`; we ensure a row
//! exists in `{namespace}.jobs` (the FK target) the first time any field
//! for a job is touched, then keep the actual value/revision pairs in
//! `{namespace}.jobs_attributes`, one row per `(job_id, field)` — scalar
//! `Store::get`/`set_if` ops use the sentinel field name
//! [`SCALAR_FIELD`] so the job's whole-document fields (e.g. `udata`) share
//! the same table as its per-field hash entries (`status`, `jdata`, …)
//! without a second schema.
//!
//! Grounded on `PgJobStore`'s `FOR UPDATE ... SKIP LOCKED` claim pattern:
//! `set_if` takes the equivalent of a row lock via `SELECT ... FOR UPDATE`
//! inside one transaction before deciding whether the expected revision
//! still holds.

use std::collections::HashMap;

use async_trait::async_trait;
use memflow::{MemFlowError, Revision, Store, StoreKey, StoreOp, Transaction};
use serde_json::Value;
use sqlx::{PgPool, Row};

pub const SCALAR_FIELD: &str = "__scalar__";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_job_row(&self, namespace: &str, job_id: &str) -> Result<(), MemFlowError> {
        sqlx::query(&format!(
            "INSERT INTO {namespace}.jobs (id, key) VALUES ($1, $1) ON CONFLICT (id) DO NOTHING"
        ))
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| MemFlowError::Backend(e.into()))?;
        Ok(())
    }

    async fn read_field(
        &self,
        namespace: &str,
        job_id: &str,
        field: &str,
    ) -> Result<Option<(Value, i64)>, MemFlowError> {
        let row = sqlx::query(&format!(
            "SELECT value, revision FROM {namespace}.jobs_attributes WHERE job_id = $1 AND field = $2"
        ))
        .bind(job_id)
        .bind(field)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MemFlowError::Backend(e.into()))?;

        Ok(match row {
            Some(row) => {
                let raw: Option<String> = row.get("value");
                let revision: i64 = row.get("revision");
                let value = match raw {
                    Some(text) => serde_json::from_str(&text)
                        .map_err(|e| MemFlowError::Backend(e.into()))?,
                    None => Value::Null,
                };
                Some((value, revision))
            }
            None => None,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get(&self, key: &StoreKey) -> Result<Option<Value>, MemFlowError> {
        let (namespace, _, job_id, field) = key.parts();
        Ok(self
            .read_field(namespace, job_id, field)
            .await?
            .map(|(value, _)| value))
    }

    async fn get_with_revision(&self, key: &StoreKey) -> Result<(Option<Value>, Revision), MemFlowError> {
        let (namespace, _, job_id, field) = key.parts();
        match self.read_field(namespace, job_id, field).await? {
            Some((value, revision)) => Ok((Some(value), Revision(revision as u64))),
            None => Ok((None, Revision::NONE)),
        }
    }

    async fn set_if(&self, key: &StoreKey, value: Value, expected: Revision) -> Result<Revision, MemFlowError> {
        let (namespace, _, job_id, field) = key.parts();
        self.ensure_job_row(namespace, job_id).await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MemFlowError::Backend(e.into()))?;

        let current: Option<i64> = sqlx::query(&format!(
            "SELECT revision FROM {namespace}.jobs_attributes WHERE job_id = $1 AND field = $2 FOR UPDATE"
        ))
        .bind(job_id)
        .bind(field)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| MemFlowError::Backend(e.into()))?
        .map(|row: sqlx::postgres::PgRow| row.get("revision"));

        let current_revision = current.map(|r| r as u64).unwrap_or(0);
        if current_revision != expected.0 {
            return Err(MemFlowError::StoreConflict);
        }

        let next = current_revision + 1;
        let payload = serde_json::to_string(&value).map_err(|e| MemFlowError::Backend(e.into()))?;
        sqlx::query(&format!(
            "INSERT INTO {namespace}.jobs_attributes (job_id, field, value, revision)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (job_id, field) DO UPDATE SET value = EXCLUDED.value, revision = EXCLUDED.revision"
        ))
        .bind(job_id)
        .bind(field)
        .bind(payload)
        .bind(next as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| MemFlowError::Backend(e.into()))?;

        tx.commit().await.map_err(|e| MemFlowError::Backend(e.into()))?;
        Ok(Revision(next))
    }

    async fn hget(&self, key: &StoreKey, field: &str) -> Result<Option<Value>, MemFlowError> {
        let (namespace, _, job_id, _) = key.parts();
        Ok(self
            .read_field(namespace, job_id, field)
            .await?
            .map(|(value, _)| value))
    }

    async fn hgetall(&self, key: &StoreKey) -> Result<HashMap<String, Value>, MemFlowError> {
        let (namespace, _, job_id, _) = key.parts();
        let rows = sqlx::query(&format!(
            "SELECT field, value FROM {namespace}.jobs_attributes WHERE job_id = $1 AND field <> $2"
        ))
        .bind(job_id)
        .bind(SCALAR_FIELD)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MemFlowError::Backend(e.into()))?;

        let mut out = HashMap::new();
        for row in rows {
            let field: String = row.get("field");
            let raw: Option<String> = row.get("value");
            let value = match raw {
                Some(text) => serde_json::from_str(&text).map_err(|e| MemFlowError::Backend(e.into()))?,
                None => Value::Null,
            };
            out.insert(field, value);
        }
        Ok(out)
    }

    async fn commit(&self, txn: Transaction) -> Result<(), MemFlowError> {
        let mut db_tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MemFlowError::Backend(e.into()))?;

        for op in txn.ops() {
            match op {
                StoreOp::Set { key, value } => {
                    let (namespace, _, job_id, field) = key.parts();
                    upsert_field(&mut db_tx, namespace, job_id, field, value.clone()).await?;
                }
                StoreOp::HSet { key, field, value } => {
                    let (namespace, _, job_id, _) = key.parts();
                    upsert_field(&mut db_tx, namespace, job_id, field, value.clone()).await?;
                }
                StoreOp::HIncrBy { key, field, amount } => {
                    let (namespace, _, job_id, _) = key.parts();
                    let row = sqlx::query(&format!(
                        "SELECT value FROM {namespace}.jobs_attributes WHERE job_id = $1 AND field = $2 FOR UPDATE"
                    ))
                    .bind(job_id)
                    .bind(field.as_str())
                    .fetch_optional(&mut *db_tx)
                    .await
                    .map_err(|e| MemFlowError::Backend(e.into()))?;
                    let current: i64 = row
                        .and_then(|r: sqlx::postgres::PgRow| r.get::<Option<String>, _>("value"))
                        .and_then(|text| serde_json::from_str::<Value>(&text).ok())
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    upsert_field(
                        &mut db_tx,
                        namespace,
                        job_id,
                        field,
                        Value::from(current + amount),
                    )
                    .await?;
                }
                StoreOp::Delete { key } => {
                    let (namespace, _, job_id, field) = key.parts();
                    sqlx::query(&format!(
                        "DELETE FROM {namespace}.jobs_attributes WHERE job_id = $1 AND field = $2"
                    ))
                    .bind(job_id)
                    .bind(field)
                    .execute(&mut *db_tx)
                    .await
                    .map_err(|e| MemFlowError::Backend(e.into()))?;
                }
            }
        }

        db_tx.commit().await.map_err(|e| MemFlowError::Backend(e.into()))?;
        Ok(())
    }
}

async fn upsert_field(
    db_tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    namespace: &str,
    job_id: &str,
    field: &str,
    value: Value,
) -> Result<(), MemFlowError> {
    sqlx::query(&format!(
        "INSERT INTO {namespace}.jobs (id, key) VALUES ($1, $1) ON CONFLICT (id) DO NOTHING"
    ))
    .bind(job_id)
    .execute(&mut *db_tx)
    .await
    .map_err(|e| MemFlowError::Backend(e.into()))?;

    let payload = serde_json::to_string(&value).map_err(|e| MemFlowError::Backend(e.into()))?;
    sqlx::query(&format!(
        "INSERT INTO {namespace}.jobs_attributes (job_id, field, value, revision)
         VALUES ($1, $2, $3, 1)
         ON CONFLICT (job_id, field) DO UPDATE SET value = EXCLUDED.value, revision = {namespace}.jobs_attributes.revision + 1"
    ))
    .bind(job_id)
    .bind(field)
    .bind(payload)
    .execute(&mut *db_tx)
    .await
    .map_err(|e| MemFlowError::Backend(e.into()))?;

    // The `status`/`expire_at` hash fields are mirrored onto the `jobs` row's
    // own `status`/`expired_at`/`is_live` columns so `prune()` (which scans
    // `jobs` directly rather than joining `jobs_attributes`) sees them
    // without a second round trip.
    match field {
        "status" => {
            if let Some(status) = value.as_i64() {
                sqlx::query(&format!(
                    "UPDATE {namespace}.jobs SET status = $2, is_live = ($2 <> 0) WHERE id = $1"
                ))
                .bind(job_id)
                .bind(status)
                .execute(&mut *db_tx)
                .await
                .map_err(|e| MemFlowError::Backend(e.into()))?;
            }
        }
        "expire_at" => {
            if let Some(at) = value.as_str().and_then(|s| {
                chrono::DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.with_timezone(&chrono::Utc))
            }) {
                sqlx::query(&format!("UPDATE {namespace}.jobs SET expired_at = $2 WHERE id = $1"))
                    .bind(job_id)
                    .bind(at)
                    .execute(&mut *db_tx)
                    .await
                    .map_err(|e| MemFlowError::Backend(e.into()))?;
            }
        }
        _ => {}
    }
    Ok(())
}
