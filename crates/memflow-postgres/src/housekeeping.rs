//! Thin wrapper around `{namespace}.prune(...)`, the housekeeping function
//! defined in [`crate::schema`]. Grounded on `PgJobStore::reclaim_expired`/
//! `cleanup_succeeded`/`stats` (`seesaw-job-postgres`) — periodic
//! maintenance queries run by an operator's cron or the `prune` CLI
//! subcommand, separate from the request-path `Store`/`StreamBus` traits.

use chrono::Duration;
use memflow::MemFlowError;
use sqlx::{PgPool, Row};

#[derive(Debug, Clone, Copy, Default)]
pub struct PruneOptions {
    pub retention: Option<Duration>,
    pub prune_jobs: bool,
    pub prune_streams: bool,
    pub strip_attributes: bool,
    pub entity_list: Option<Vec<String>>,
    pub prune_transient: bool,
    pub keep_hmark: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PruneReport {
    pub deleted_jobs: i64,
    pub deleted_streams: i64,
    pub stripped_attributes: i64,
    pub deleted_transient: i64,
    pub marked_pruned: i64,
}

pub async fn prune(pool: &PgPool, namespace: &str, options: PruneOptions) -> Result<PruneReport, MemFlowError> {
    let retention = options.retention.unwrap_or_else(|| Duration::days(30));
    let row = sqlx::query(&format!(
        "SELECT * FROM {namespace}.prune($1, $2, $3, $4, $5, $6, $7)"
    ))
    .bind(retention)
    .bind(options.prune_jobs)
    .bind(options.prune_streams)
    .bind(options.strip_attributes)
    .bind(options.entity_list)
    .bind(options.prune_transient)
    .bind(options.keep_hmark)
    .fetch_one(pool)
    .await
    .map_err(|e| MemFlowError::Backend(e.into()))?;

    Ok(PruneReport {
        deleted_jobs: row.get("deleted_jobs"),
        deleted_streams: row.get("deleted_streams"),
        stripped_attributes: row.get("stripped_attributes"),
        deleted_transient: row.get("deleted_transient"),
        marked_pruned: row.get("marked_pruned"),
    })
}
