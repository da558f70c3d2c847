//! DDL for one namespace's schema: `N.jobs`, `N.jobs_attributes`,
//! `N.streams` (hash-partitioned 8 ways), and the `N.prune()` housekeeping
//! function, exactly as laid out in the persisted-schema section of the
//! external interface. An operator runs [`ddl_for_namespace`]'s output once
//! per namespace before pointing a [`crate::PgStore`]/[`crate::PgStreamBus`]/
//! [`crate::PgJournal`] at it.
//!
//! Grounded on `seesaw-job-postgres`'s embedded-schema-as-doc-comment
//! convention, generalized from one fixed `jobs` table to a
//! namespace-parameterized template.

/// Render the full namespace DDL, substituting `namespace` as the Postgres
/// schema name. `namespace` must already be sanitized
/// ([`memflow::sanitize_app_id`]) — this function does not quote or escape
/// it.
pub fn ddl_for_namespace(namespace: &str) -> String {
    format!(
        r#"
CREATE SCHEMA IF NOT EXISTS {ns};

CREATE TABLE IF NOT EXISTS {ns}.jobs (
    id TEXT PRIMARY KEY,
    key TEXT NOT NULL,
    status BIGINT NOT NULL DEFAULT 0,
    entity TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    expired_at TIMESTAMPTZ,
    pruned_at TIMESTAMPTZ,
    is_live BOOLEAN NOT NULL DEFAULT true
);
CREATE INDEX IF NOT EXISTS idx_{ns}_jobs_live ON {ns}.jobs (is_live) WHERE is_live;

CREATE TYPE IF NOT EXISTS {ns}_attribute_kind AS ENUM
    ('jdata', 'udata', 'jmark', 'hmark', 'adata', 'status', 'other');

CREATE TABLE IF NOT EXISTS {ns}.jobs_attributes (
    job_id TEXT NOT NULL REFERENCES {ns}.jobs(id) ON DELETE CASCADE,
    field TEXT NOT NULL,
    value TEXT,
    revision BIGINT NOT NULL DEFAULT 0,
    kind {ns}_attribute_kind NOT NULL DEFAULT 'other',
    PRIMARY KEY (job_id, field)
);

CREATE TABLE IF NOT EXISTS {ns}.journal_entries (
    job_id TEXT NOT NULL,
    dimension TEXT NOT NULL,
    exec_index BIGINT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (job_id, dimension, exec_index)
);

CREATE TABLE IF NOT EXISTS {ns}.streams (
    stream_name TEXT NOT NULL,
    group_name TEXT NOT NULL DEFAULT 'default',
    id BIGSERIAL,
    message TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    reserved_at TIMESTAMPTZ,
    reserved_by TEXT,
    reserved_until TIMESTAMPTZ,
    delivery_attempts INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (stream_name, id)
) PARTITION BY HASH (stream_name);

{partitions}

CREATE OR REPLACE FUNCTION {ns}.prune(
    retention INTERVAL,
    prune_jobs BOOLEAN,
    prune_streams BOOLEAN,
    strip_attributes BOOLEAN,
    entity_list TEXT[],
    prune_transient BOOLEAN,
    keep_hmark BOOLEAN
) RETURNS TABLE (
    deleted_jobs BIGINT,
    deleted_streams BIGINT,
    stripped_attributes BIGINT,
    deleted_transient BIGINT,
    marked_pruned BIGINT
) AS $$
DECLARE
    v_deleted_jobs BIGINT := 0;
    v_deleted_streams BIGINT := 0;
    v_stripped_attributes BIGINT := 0;
    v_deleted_transient BIGINT := 0;
    v_marked_pruned BIGINT := 0;
BEGIN
    -- A job reaching status == 0 (done) is marked pruned as soon as it is
    -- seen, independent of whether it is old enough to hard-delete yet;
    -- this is the bookkeeping step that makes its adata/hmark/status/other
    -- attributes eligible for stripping below, in this same transaction.
    WITH marked AS (
        UPDATE {ns}.jobs SET pruned_at = now()
        WHERE status = 0
          AND pruned_at IS NULL
          AND (entity_list IS NULL OR entity IS NULL OR entity = ANY(entity_list))
        RETURNING id
    )
    SELECT count(*) INTO v_marked_pruned FROM marked;

    IF strip_attributes THEN
        WITH stripped AS (
            DELETE FROM {ns}.jobs_attributes
            WHERE kind IN ('adata', 'hmark', 'status', 'other')
              AND (NOT keep_hmark OR kind <> 'hmark')
              AND job_id IN (SELECT id FROM {ns}.jobs WHERE pruned_at IS NOT NULL)
            RETURNING job_id
        )
        SELECT count(*) INTO v_stripped_attributes FROM stripped;
    END IF;

    IF prune_jobs THEN
        WITH doomed AS (
            SELECT id FROM {ns}.jobs
            WHERE NOT is_live
              AND (entity_list IS NULL OR entity IS NULL OR entity = ANY(entity_list))
              AND created_at < now() - retention
        ), deleted AS (
            DELETE FROM {ns}.jobs WHERE id IN (SELECT id FROM doomed) RETURNING id
        )
        SELECT count(*) INTO v_deleted_jobs FROM deleted;
    END IF;

    IF prune_transient THEN
        WITH doomed_transient AS (
            DELETE FROM {ns}.jobs_attributes
            WHERE kind = 'adata'
              AND job_id NOT IN (SELECT id FROM {ns}.jobs)
            RETURNING job_id
        )
        SELECT count(*) INTO v_deleted_transient FROM doomed_transient;
    END IF;

    IF prune_streams THEN
        WITH doomed_streams AS (
            DELETE FROM {ns}.streams
            WHERE created_at < now() - retention
            RETURNING stream_name
        )
        SELECT count(*) INTO v_deleted_streams FROM doomed_streams;
    END IF;

    RETURN QUERY SELECT v_deleted_jobs, v_deleted_streams, v_stripped_attributes,
        v_deleted_transient, v_marked_pruned;
END;
$$ LANGUAGE plpgsql;
"#,
        ns = namespace,
        partitions = hash_partitions(namespace, 8),
    )
}

fn hash_partitions(namespace: &str, count: u32) -> String {
    (0..count)
        .map(|i| {
            format!(
                "CREATE TABLE IF NOT EXISTS {ns}.streams_p{i} PARTITION OF {ns}.streams \
                 FOR VALUES WITH (MODULUS {count}, REMAINDER {i});",
                ns = namespace,
                i = i,
                count = count,
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_mentions_all_three_tables_and_prune_function() {
        let ddl = ddl_for_namespace("acme");
        assert!(ddl.contains("acme.jobs"));
        assert!(ddl.contains("acme.jobs_attributes"));
        assert!(ddl.contains("acme.streams"));
        assert!(ddl.contains("acme.prune"));
        assert!(ddl.contains("MODULUS 8"));
    }
}
