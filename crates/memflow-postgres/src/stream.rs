//! Postgres-backed [`memflow::StreamBus`].
//!
//! `consume` claims rows with `FOR UPDATE SKIP LOCKED`, the same pattern
//! `PgJobStore::claim_ready` uses to let many concurrent workers poll the
//! same table without blocking each other on row locks. A message stays in
//! `{namespace}.streams` until [`PgStreamBus::ack`] deletes it; an
//! unacknowledged reservation becomes reclaimable again once
//! `reserved_until` elapses.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use memflow::{ConsumeOptions, MemFlowError, StreamBus, StreamMessage};
use serde_json::Value;
use sqlx::{PgPool, Row};

#[derive(Clone)]
pub struct PgStreamBus {
    pool: PgPool,
    namespace: String,
}

impl PgStreamBus {
    pub fn new(pool: PgPool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
        }
    }
}

fn row_to_message(row: sqlx::postgres::PgRow, stream: &str) -> Result<StreamMessage, MemFlowError> {
    let id: i64 = row.get("id");
    let message: String = row.get("message");
    let created_at: chrono::DateTime<Utc> = row.get("created_at");
    let reserved_by: Option<String> = row.get("reserved_by");
    let reserved_until: Option<chrono::DateTime<Utc>> = row.get("reserved_until");
    let delivery_attempts: i32 = row.get("delivery_attempts");
    Ok(StreamMessage {
        id,
        stream: stream.to_string(),
        body: serde_json::from_str(&message).map_err(|e| MemFlowError::Backend(e.into()))?,
        created_at,
        reserved_by,
        reserved_until,
        delivery_attempts: delivery_attempts as u32,
    })
}

#[async_trait]
impl StreamBus for PgStreamBus {
    async fn publish(&self, stream: &str, body: Value) -> Result<i64, MemFlowError> {
        let payload = serde_json::to_string(&body).map_err(|e| MemFlowError::Backend(e.into()))?;
        let row = sqlx::query(&format!(
            "INSERT INTO {}.streams (stream_name, message) VALUES ($1, $2) RETURNING id",
            self.namespace
        ))
        .bind(stream)
        .bind(payload)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| MemFlowError::Backend(e.into()))?;
        Ok(row.get("id"))
    }

    async fn consume(
        &self,
        stream: &str,
        consumer_id: &str,
        options: ConsumeOptions,
    ) -> Result<Vec<StreamMessage>, MemFlowError> {
        let reserved_until = Utc::now()
            + ChronoDuration::from_std(options.reservation_timeout).unwrap_or_else(|_| ChronoDuration::seconds(30));

        let rows = sqlx::query(&format!(
            r#"
            WITH claimable AS (
                SELECT stream_name, id
                FROM {ns}.streams
                WHERE stream_name = $1
                  AND (reserved_until IS NULL OR reserved_until <= now())
                ORDER BY id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {ns}.streams s
            SET reserved_by = $3,
                reserved_until = $4,
                delivery_attempts = s.delivery_attempts + 1
            FROM claimable
            WHERE s.stream_name = claimable.stream_name AND s.id = claimable.id
            RETURNING s.id, s.message, s.created_at, s.reserved_by, s.reserved_until, s.delivery_attempts
            "#,
            ns = self.namespace
        ))
        .bind(stream)
        .bind(options.batch_size as i64)
        .bind(consumer_id)
        .bind(reserved_until)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MemFlowError::Backend(e.into()))?;

        rows.into_iter().map(|row| row_to_message(row, stream)).collect()
    }

    async fn ack(&self, stream: &str, message_id: i64) -> Result<(), MemFlowError> {
        sqlx::query(&format!(
            "DELETE FROM {}.streams WHERE stream_name = $1 AND id = $2",
            self.namespace
        ))
        .bind(stream)
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(|e| MemFlowError::Backend(e.into()))?;
        Ok(())
    }

    async fn nack(&self, stream: &str, message_id: i64) -> Result<(), MemFlowError> {
        sqlx::query(&format!(
            "UPDATE {}.streams SET reserved_by = NULL, reserved_until = NULL
             WHERE stream_name = $1 AND id = $2",
            self.namespace
        ))
        .bind(stream)
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(|e| MemFlowError::Backend(e.into()))?;
        Ok(())
    }

    async fn depth(&self, stream: &str) -> Result<usize, MemFlowError> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM {}.streams WHERE stream_name = $1",
            self.namespace
        ))
        .bind(stream)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| MemFlowError::Backend(e.into()))?;
        let n: i64 = row.get("n");
        Ok(n as usize)
    }

    async fn delete_stream(&self, stream: &str) -> Result<(), MemFlowError> {
        sqlx::query(&format!("DELETE FROM {}.streams WHERE stream_name = $1", self.namespace))
            .bind(stream)
            .execute(&self.pool)
            .await
            .map_err(|e| MemFlowError::Backend(e.into()))?;
        Ok(())
    }
}
