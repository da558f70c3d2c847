//! `memflow migrate`: provision one namespace's schema.

use anyhow::{Context, Result};
use memflow_postgres::schema::ddl_for_namespace;
use sqlx::PgPool;

pub async fn run(pool: &PgPool, namespace: &str) -> Result<()> {
    let ddl = ddl_for_namespace(namespace);
    sqlx::raw_sql(&ddl)
        .execute(pool)
        .await
        .with_context(|| format!("failed to provision schema for namespace {namespace}"))?;
    tracing::info!(namespace, "namespace schema provisioned");
    Ok(())
}
