//! The Router: the stream consume loop — claim, dispatch, ack-and-delete,
//! shutdown grace period — with deterministic per-tick batching.
//!
//! Grounded on `runtime.rs`'s `Runtime::run()`: the `BTreeMap<(TypeId,
//! CorrelationId), _>` deterministic batching there becomes a
//! `BTreeMap<String, Vec<StreamMessage>>` keyed by job id here, and the
//! isolation property — "one bad machine shouldn't stop others" — carries
//! over verbatim as "one bad message shouldn't stop the batch": a handler
//! error for one message is recorded and the loop continues to the rest of
//! the batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

#[cfg(debug_assertions)]
use crate::audit::{AuditEntryBuilder, SharedAuditLog};
use crate::error::MemFlowError;
use crate::stream::{ConsumeOptions, StreamBus, StreamMessage};

/// Implemented per-message to route a claimed batch to the right handler.
/// The Router calls `handle` once per message, inside the deterministic
/// per-job-id ordering described above, and acks on success.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &StreamMessage) -> Result<(), MemFlowError>;
}

pub struct Router<B: StreamBus, H: MessageHandler> {
    bus: Arc<B>,
    handler: Arc<H>,
    stream: String,
    consumer_id: String,
    options: ConsumeOptions,
    shutdown: Arc<Notify>,
    shutdown_grace_period: Duration,
    #[cfg(debug_assertions)]
    audit_log: SharedAuditLog,
}

impl<B: StreamBus, H: MessageHandler> Router<B, H> {
    pub fn new(
        bus: Arc<B>,
        handler: Arc<H>,
        stream: impl Into<String>,
        consumer_id: impl Into<String>,
        options: ConsumeOptions,
        shutdown_grace_period: Duration,
    ) -> Self {
        Self {
            bus,
            handler,
            stream: stream.into(),
            consumer_id: consumer_id.into(),
            options,
            shutdown: Arc::new(Notify::new()),
            shutdown_grace_period,
            #[cfg(debug_assertions)]
            audit_log: Arc::new(crate::audit::AuditLog::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Debug-only log of recent consume-dispatch-ack ticks, for spotting
    /// streams that are polled but never drained (wiring mistakes, dead
    /// task queues). Zero-cost in release builds — not compiled in.
    #[cfg(debug_assertions)]
    pub fn audit_log(&self) -> SharedAuditLog {
        self.audit_log.clone()
    }

    /// Run the consume loop until `shutdown_handle().notify_one()` is
    /// called, then drain in-flight work for up to `shutdown_grace_period`
    /// before returning.
    pub async fn run(&self, poll_interval: Duration) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!(stream = %self.stream, "router shutting down, draining in-flight batch");
                    let _ = tokio::time::timeout(self.shutdown_grace_period, self.tick()).await;
                    break;
                }
                _ = tokio::time::sleep(poll_interval) => {
                    if let Err(error) = self.tick().await {
                        tracing::warn!(stream = %self.stream, %error, "router tick failed");
                    }
                }
            }
        }
    }

    /// One consume-dispatch-ack cycle. Exposed directly for tests and for
    /// callers that want to drive the loop themselves.
    pub async fn tick(&self) -> Result<(), MemFlowError> {
        let claimed = self
            .bus
            .consume(&self.stream, &self.consumer_id, self.options)
            .await?;
        if claimed.is_empty() {
            return Ok(());
        }

        // Deterministic batching keyed by job id.
        let mut batches: BTreeMap<String, Vec<StreamMessage>> = BTreeMap::new();
        for message in claimed {
            let job_id = message
                .body
                .get("job_id")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            batches.entry(job_id).or_default().push(message);
        }

        #[cfg(debug_assertions)]
        let mut audit = AuditEntryBuilder::new(self.stream.clone());

        for (_job_id, messages) in batches {
            for message in messages {
                #[cfg(debug_assertions)]
                audit.observed(message.id);

                match self.handler.handle(&message).await {
                    Ok(()) => {
                        if let Err(error) = self.bus.ack(&self.stream, message.id).await {
                            tracing::warn!(%error, message_id = message.id, "ack failed");
                        }
                        #[cfg(debug_assertions)]
                        audit.emitted(message.id);
                    }
                    Err(error) if error.is_silent() => {
                        // Duplicate/stale redelivery: ack and move on.
                        let _ = self.bus.ack(&self.stream, message.id).await;
                    }
                    Err(error) => {
                        tracing::warn!(%error, message_id = message.id, "handler failed, message will be retried");
                        let _ = self.bus.nack(&self.stream, message.id).await;
                    }
                }
            }
        }

        #[cfg(debug_assertions)]
        self.audit_log.record(audit.build());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::InMemoryStreamBus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        count: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _message: &StreamMessage) -> Result<(), MemFlowError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn tick_acks_handled_messages() {
        let bus = Arc::new(InMemoryStreamBus::new());
        bus.publish("ns.wf:engine", serde_json::json!({ "job_id": "a" }))
            .await
            .unwrap();
        bus.publish("ns.wf:engine", serde_json::json!({ "job_id": "b" }))
            .await
            .unwrap();

        let handler = Arc::new(CountingHandler {
            count: AtomicUsize::new(0),
        });
        let router = Router::new(
            bus.clone(),
            handler.clone(),
            "ns.wf:engine",
            "worker-1",
            ConsumeOptions::default(),
            Duration::from_secs(1),
        );
        router.tick().await.unwrap();

        assert_eq!(handler.count.load(Ordering::SeqCst), 2);
        assert_eq!(bus.depth("ns.wf:engine").await.unwrap(), 0);
    }

    struct FailingHandler;

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(&self, _message: &StreamMessage) -> Result<(), MemFlowError> {
            Err(MemFlowError::Transient("boom".into()))
        }
    }

    #[tokio::test]
    async fn failed_messages_are_nacked_not_acked() {
        let bus = Arc::new(InMemoryStreamBus::new());
        bus.publish("ns.wf:engine", serde_json::json!({ "job_id": "a" }))
            .await
            .unwrap();

        let router = Router::new(
            bus.clone(),
            Arc::new(FailingHandler),
            "ns.wf:engine",
            "worker-1",
            ConsumeOptions::default(),
            Duration::from_secs(1),
        );
        router.tick().await.unwrap();
        assert_eq!(bus.depth("ns.wf:engine").await.unwrap(), 1);
    }
}
