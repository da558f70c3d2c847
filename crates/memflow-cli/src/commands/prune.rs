//! `memflow prune`: run the namespace's `prune()` housekeeping function once.

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use memflow::parse_duration;
use memflow_postgres::{prune as run_prune, PruneOptions};
use sqlx::PgPool;

#[allow(clippy::too_many_arguments)]
pub async fn run(
    pool: &PgPool,
    namespace: &str,
    retention: &str,
    jobs: bool,
    streams: bool,
    attributes: bool,
    transient: bool,
    keep_hmark: bool,
) -> Result<()> {
    let retention = parse_duration(retention)
        .context("invalid --retention")?
        .map(|d| ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::days(30)));

    let report = run_prune(
        pool,
        namespace,
        PruneOptions {
            retention,
            prune_jobs: jobs,
            prune_streams: streams,
            strip_attributes: attributes,
            entity_list: None,
            prune_transient: transient,
            keep_hmark,
        },
    )
    .await
    .context("prune() failed")?;

    tracing::info!(
        namespace,
        deleted_jobs = report.deleted_jobs,
        deleted_streams = report.deleted_streams,
        stripped_attributes = report.stripped_attributes,
        deleted_transient = report.deleted_transient,
        marked_pruned = report.marked_pruned,
        "prune complete"
    );
    Ok(())
}
