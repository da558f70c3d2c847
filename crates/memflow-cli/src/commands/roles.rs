//! `memflow engine` / `memflow worker`: long-running [`Router`] loops
//! against a Postgres-backed [`PgStreamBus`].
//!
//! This binary carries no user workflow or activity code — that's an
//! embedding concern of the application that links `memflow` as a library
//! and registers its own [`memflow::ActivityRegistry`]. What this CLI
//! provides is the ops-visible half: a role-tagged consume/dispatch/ack
//! loop a deployment can point at a task queue to smoke-test connectivity,
//! watch stream traffic, and drain it against shutdown signals — kept
//! separate from the library crates it operates on, the way operational
//! tooling is kept separate from the libraries it drives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use memflow::{ConsumeOptions, MemFlowError, MessageHandler, Router, StreamMessage};
use memflow_postgres::PgStreamBus;
use sqlx::PgPool;
use tokio::signal;

/// Logs every claimed message and acks it; records nothing to the Store or
/// Journal. Stands in for the embedding application's real engine/worker
/// dispatch, which requires compiled-in workflow/activity definitions this
/// binary does not have.
struct LoggingHandler {
    role: &'static str,
}

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: &StreamMessage) -> Result<(), MemFlowError> {
        let topic = message
            .body
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("activity_call");
        tracing::info!(
            role = self.role,
            stream = %message.stream,
            message_id = message.id,
            topic,
            delivery_attempts = message.delivery_attempts,
            "claimed message"
        );
        Ok(())
    }
}

async fn run_role(
    pool: PgPool,
    namespace: &str,
    stream: String,
    role: &'static str,
    batch_size: usize,
    reservation_timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let bus = Arc::new(PgStreamBus::new(pool, namespace));
    let consumer_id = format!("{role}-{}", memflow::guid());
    let handler = Arc::new(LoggingHandler { role });

    let router = Router::new(
        bus,
        handler,
        stream.clone(),
        consumer_id,
        ConsumeOptions {
            batch_size,
            reservation_timeout,
        },
        Duration::from_secs(10),
    );

    tracing::info!(role, stream = %stream, "router starting");
    let shutdown = router.shutdown_handle();
    let run = router.run(poll_interval);
    tokio::pin!(run);

    tokio::select! {
        _ = &mut run => {}
        _ = signal::ctrl_c() => {
            tracing::info!(role, "ctrl-c received, signaling shutdown");
            shutdown.notify_one();
            run.await;
        }
    }
    Ok(())
}

pub async fn run_engine(
    pool: PgPool,
    namespace: &str,
    task_queue: &str,
    batch_size: usize,
    reservation_timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    // Matches Engine::engine_stream's "{namespace}.{task_queue}:" — a bare
    // trailing colon denotes an engine stream.
    let stream = format!("{namespace}.{task_queue}:");
    run_role(pool, namespace, stream, "engine", batch_size, reservation_timeout, poll_interval).await
}

pub async fn run_worker(
    pool: PgPool,
    namespace: &str,
    task_queue: &str,
    batch_size: usize,
    reservation_timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    // Matches ActivityProxy::worker_stream's dispatch target
    // "{namespace}.{task_queue}" — no trailing colon.
    let stream = format!("{namespace}.{task_queue}");
    run_role(pool, namespace, stream, "worker", batch_size, reservation_timeout, poll_interval).await
}
