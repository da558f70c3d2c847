//! The StreamBus: a durable, ordered, at-least-once message channel with
//! reservation/lease semantics.
//!
//! Grounded on `bus.rs`'s `EventBus` for the publish/subscribe shape, but
//! the broadcast channel's at-most-once/no-replay contract is replaced with
//! a claim-and-ack model taken from `job.rs`'s
//! `JobStore::claim_ready`/`mark_succeeded` and the Postgres reference's
//! `FOR UPDATE SKIP LOCKED` claiming — a message is only removed once the
//! consumer acknowledges it, and an unacknowledged reservation expires back
//! to claimable after its timeout.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::MemFlowError;

/// Which side of the engine a stream belongs to, derived from its name per
/// the external interface's stream key convention: a trailing bare `:`
/// denotes an ENGINE stream, anything else is a WORKER stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamGroup {
    Engine,
    Worker,
}

pub fn stream_group_for(stream: &str) -> StreamGroup {
    if stream.ends_with(':') {
        StreamGroup::Engine
    } else {
        StreamGroup::Worker
    }
}

/// A single durable message on a stream.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub id: i64,
    pub stream: String,
    pub body: Value,
    pub created_at: DateTime<Utc>,
    pub reserved_by: Option<String>,
    pub reserved_until: Option<DateTime<Utc>>,
    pub delivery_attempts: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ConsumeOptions {
    pub batch_size: usize,
    pub reservation_timeout: Duration,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            reservation_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
pub trait StreamBus: Send + Sync {
    async fn publish(&self, stream: &str, body: Value) -> Result<i64, MemFlowError>;

    /// Claim up to `options.batch_size` unreserved (or expired-reservation)
    /// messages on `stream` for `consumer_id`, marking them reserved until
    /// `options.reservation_timeout` from now.
    async fn consume(
        &self,
        stream: &str,
        consumer_id: &str,
        options: ConsumeOptions,
    ) -> Result<Vec<StreamMessage>, MemFlowError>;

    async fn ack(&self, stream: &str, message_id: i64) -> Result<(), MemFlowError>;

    /// Release a reservation early without acknowledging, so the message
    /// becomes immediately claimable again (used on a handler error that
    /// should be retried sooner than the reservation timeout).
    async fn nack(&self, stream: &str, message_id: i64) -> Result<(), MemFlowError>;

    async fn depth(&self, stream: &str) -> Result<usize, MemFlowError>;

    async fn delete_stream(&self, stream: &str) -> Result<(), MemFlowError>;
}

struct InMemoryStreamState {
    messages: VecDeque<StreamMessage>,
}

/// In-memory `StreamBus` for tests and the single-process deployment mode.
pub struct InMemoryStreamBus {
    streams: Mutex<std::collections::HashMap<String, InMemoryStreamState>>,
    next_id: AtomicI64,
}

impl Default for InMemoryStreamBus {
    fn default() -> Self {
        Self {
            streams: Mutex::new(std::collections::HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl InMemoryStreamBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreamBus for InMemoryStreamBus {
    async fn publish(&self, stream: &str, body: Value) -> Result<i64, MemFlowError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = StreamMessage {
            id,
            stream: stream.to_string(),
            body,
            created_at: Utc::now(),
            reserved_by: None,
            reserved_until: None,
            delivery_attempts: 0,
        };
        let mut streams = self.streams.lock().expect("stream mutex poisoned");
        streams
            .entry(stream.to_string())
            .or_insert_with(|| InMemoryStreamState {
                messages: VecDeque::new(),
            })
            .messages
            .push_back(message);
        Ok(id)
    }

    async fn consume(
        &self,
        stream: &str,
        consumer_id: &str,
        options: ConsumeOptions,
    ) -> Result<Vec<StreamMessage>, MemFlowError> {
        let now = Utc::now();
        let mut streams = self.streams.lock().expect("stream mutex poisoned");
        let Some(state) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let mut claimed = Vec::new();
        for message in state.messages.iter_mut() {
            if claimed.len() >= options.batch_size {
                break;
            }
            let claimable = match message.reserved_until {
                None => true,
                Some(until) => until <= now,
            };
            if claimable {
                message.reserved_by = Some(consumer_id.to_string());
                message.reserved_until = Some(
                    now + chrono::Duration::from_std(options.reservation_timeout)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30)),
                );
                message.delivery_attempts += 1;
                claimed.push(message.clone());
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, stream: &str, message_id: i64) -> Result<(), MemFlowError> {
        let mut streams = self.streams.lock().expect("stream mutex poisoned");
        if let Some(state) = streams.get_mut(stream) {
            state.messages.retain(|m| m.id != message_id);
        }
        Ok(())
    }

    async fn nack(&self, stream: &str, message_id: i64) -> Result<(), MemFlowError> {
        let mut streams = self.streams.lock().expect("stream mutex poisoned");
        if let Some(state) = streams.get_mut(stream) {
            if let Some(message) = state.messages.iter_mut().find(|m| m.id == message_id) {
                message.reserved_by = None;
                message.reserved_until = None;
            }
        }
        Ok(())
    }

    async fn depth(&self, stream: &str) -> Result<usize, MemFlowError> {
        let streams = self.streams.lock().expect("stream mutex poisoned");
        Ok(streams.get(stream).map(|s| s.messages.len()).unwrap_or(0))
    }

    async fn delete_stream(&self, stream: &str) -> Result<(), MemFlowError> {
        let mut streams = self.streams.lock().expect("stream mutex poisoned");
        streams.remove(stream);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_consume_then_ack_drains_the_stream() {
        let bus = InMemoryStreamBus::new();
        bus.publish("ns.wf:engine", Value::from("hello"))
            .await
            .unwrap();
        assert_eq!(bus.depth("ns.wf:engine").await.unwrap(), 1);

        let claimed = bus
            .consume("ns.wf:engine", "worker-1", ConsumeOptions::default())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].delivery_attempts, 1);

        // Still present until acked, but not reclaimable by another consumer.
        let reclaimed = bus
            .consume("ns.wf:engine", "worker-2", ConsumeOptions::default())
            .await
            .unwrap();
        assert!(reclaimed.is_empty());

        bus.ack("ns.wf:engine", claimed[0].id).await.unwrap();
        assert_eq!(bus.depth("ns.wf:engine").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_reservation_is_reclaimable() {
        let bus = InMemoryStreamBus::new();
        bus.publish("ns.wf:worker", Value::from("a")).await.unwrap();
        let options = ConsumeOptions {
            batch_size: 10,
            reservation_timeout: Duration::from_millis(1),
        };
        let first = bus
            .consume("ns.wf:worker", "w1", options)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = bus
            .consume("ns.wf:worker", "w2", options)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].delivery_attempts, 2);
    }

    #[test]
    fn stream_group_derives_from_trailing_colon() {
        assert_eq!(stream_group_for("ns.wf"), StreamGroup::Worker);
        assert_eq!(stream_group_for("ns.wf:"), StreamGroup::Engine);
    }
}
