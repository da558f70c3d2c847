//! memflow-cli
//!
//! Operational entry point for running a `memflow` engine or worker loop,
//! and for driving namespace maintenance, against a Postgres backend.
//!
//! Grounded loosely on `dev-cli`'s clap + `tracing-subscriber` conventions
//! (subcommand enum, `EnvFilter::try_from_default_env` fallback) and on
//! `workflow_server.rs`'s `tracing_subscriber::registry()...init()` startup
//! shape; none of `dev-cli`'s devops command content is reused, since this
//! binary has no interactive menu surface of its own.

mod commands;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use memflow::{MemFlowConfig, ProviderRegistry};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "memflow")]
#[command(about = "Run memflow engines/workers and maintain a namespace's Postgres schema")]
#[command(version)]
struct Cli {
    /// Postgres connection string. Falls back to $DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Namespace (tenant schema) to operate against.
    #[arg(long, global = true, default_value = "memflow")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the namespace's schema (jobs, jobs_attributes, streams, prune()).
    Migrate,

    /// Run the engine-side router loop for a task queue (consumes the
    /// trailing-colon engine stream "{namespace}.{task_queue}:").
    Engine {
        #[arg(long)]
        task_queue: String,
        #[arg(long, default_value_t = 10)]
        batch_size: usize,
        #[arg(long, default_value_t = 30)]
        reservation_timeout_secs: u64,
        #[arg(long, default_value_t = 250)]
        poll_interval_ms: u64,
    },

    /// Run the worker-side router loop for a task queue (consumes the
    /// suffix-free worker stream "{namespace}.{task_queue}").
    Worker {
        #[arg(long)]
        task_queue: String,
        #[arg(long, default_value_t = 10)]
        batch_size: usize,
        #[arg(long, default_value_t = 30)]
        reservation_timeout_secs: u64,
        #[arg(long, default_value_t = 250)]
        poll_interval_ms: u64,
    },

    /// Run the namespace's prune() housekeeping function once.
    Prune {
        /// Retention window, e.g. "7 days", "30 days".
        #[arg(long, default_value = "30 days")]
        retention: String,
        #[arg(long, default_value_t = true)]
        jobs: bool,
        #[arg(long, default_value_t = true)]
        streams: bool,
        #[arg(long, default_value_t = true)]
        attributes: bool,
        #[arg(long, default_value_t = false)]
        transient: bool,
        #[arg(long, default_value_t = false)]
        keep_hmark: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,memflow=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let namespace = memflow::sanitize_app_id(&cli.namespace);
    let database_url = cli
        .database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .context("no --database-url given and $DATABASE_URL is unset")?;

    // One pool per (task_queue, config_hash), reused across roles pointed at
    // the same namespace/task queue/backend rather than each opening its own
    // connections. Admin commands that have no task queue of their own pool
    // under a fixed "_admin" queue.
    let pools: ProviderRegistry<PgPool> = ProviderRegistry::new();

    match cli.command {
        Commands::Migrate => {
            let pool = acquire_pool(&pools, &namespace, "_admin", &database_url).await?;
            commands::migrate::run(&pool, &namespace).await
        }
        Commands::Engine {
            task_queue,
            batch_size,
            reservation_timeout_secs,
            poll_interval_ms,
        } => {
            let pool = acquire_pool(&pools, &namespace, &task_queue, &database_url).await?;
            commands::roles::run_engine(
                (*pool).clone(),
                &namespace,
                &task_queue,
                batch_size,
                Duration::from_secs(reservation_timeout_secs),
                Duration::from_millis(poll_interval_ms),
            )
            .await
        }
        Commands::Worker {
            task_queue,
            batch_size,
            reservation_timeout_secs,
            poll_interval_ms,
        } => {
            let pool = acquire_pool(&pools, &namespace, &task_queue, &database_url).await?;
            commands::roles::run_worker(
                (*pool).clone(),
                &namespace,
                &task_queue,
                batch_size,
                Duration::from_secs(reservation_timeout_secs),
                Duration::from_millis(poll_interval_ms),
            )
            .await
        }
        Commands::Prune {
            retention,
            jobs,
            streams,
            attributes,
            transient,
            keep_hmark,
        } => {
            let pool = acquire_pool(&pools, &namespace, "_admin", &database_url).await?;
            commands::prune::run(
                &pool,
                &namespace,
                &retention,
                jobs,
                streams,
                attributes,
                transient,
                keep_hmark,
            )
            .await
        }
    }
}

/// Fetch (or open) the pooled connection for `namespace`/`task_queue` from
/// `pools`, keyed by `MemFlowConfig::config_hash` so repeated CLI commands
/// against the same task queue reuse one pool instead of opening another.
async fn acquire_pool(
    pools: &ProviderRegistry<PgPool>,
    namespace: &str,
    task_queue: &str,
    database_url: &str,
) -> Result<std::sync::Arc<PgPool>> {
    let config = MemFlowConfig::new(namespace.to_string(), task_queue.to_string())
        .with_backend(memflow::BackendTag::Postgres);
    pools
        .get_or_create(&config, || async move {
            PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
                .context("failed to connect to Postgres")
        })
        .await
}
