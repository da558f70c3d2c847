//! The ActivityProxy: a retryable, journaled call to code that runs outside
//! the deterministic workflow step — and the worker-side claim/execute/ack
//! loop that services it.
//!
//! Grounded on `job.rs`'s `JobStore`/`ClaimedJob`/`CommandRegistry`/
//! `FailureKind`/`DeserializationError` quartet: `FailureKind::Retryable`/
//! `NonRetryable` map onto `Transient`/`Fatal` here, and
//! `CommandRegistry`'s versioned-deserializer pattern is reused for
//! activity-argument payload versioning via [`ActivityRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{FailureCode, MemFlowError, RetryPolicy};
use crate::journal::{Dimension, ExecIndex, Journal, JournalEntry, JournalEntryKind};
use crate::stream::StreamBus;

#[derive(Debug, Clone, Copy)]
pub struct ActivityOptions {
    pub retry_policy: RetryPolicy,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Whether a failed attempt should be retried, mirroring `job.rs`'s
/// `FailureKind`. `NonRetryable` maps onto [`MemFlowError::Fatal`] (code
/// 598) and bypasses the retry policy entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    NonRetryable,
}

/// A job claimed by a worker, ready for execution — the wire shape a worker
/// pulls off the worker stream (see [`ActivityProxy::dispatch`]). Carries
/// its own `retry_policy` and `task_queue` so a worker reporting a failure
/// can decide and republish a retry without needing to recover either from
/// elsewhere.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClaimedActivity {
    pub job_id: String,
    pub dimension: Dimension,
    pub exec_index: ExecIndex,
    pub activity_name: String,
    pub version: i32,
    pub args: Value,
    pub attempt: u32,
    pub retry_policy: RetryPolicy,
    pub task_queue: String,
    /// Set on a retry republish to the earliest time this attempt may run.
    /// A worker loop should requeue (not execute) a claim whose
    /// `not_before` is still in the future, the same due-time check
    /// `Scheduler::due_timers` uses for sleeps.
    pub not_before: Option<DateTime<Utc>>,
}

/// What actually got journaled for an activity call: either the value the
/// workflow will see on replay, or a terminal failure (fatal or
/// retries-exhausted) carrying the wire code the external interface
/// specifies.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "outcome")]
enum ActivityOutcome {
    Success { value: Value },
    Failed { code: i32, message: String, attempts: u32 },
}

/// What [`ActivityProxy::record_failure`] did with a reported failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// Republished with a backoff delay; the caller's next replay will find
    /// no journal entry yet and should not treat this as done.
    Scheduled { delay: std::time::Duration },
    /// Journaled as a terminal failure (fatal or maxed-out); the next
    /// replay's `call` returns `Err` for this `execIndex`.
    Terminal,
}

type ActivityDeserializer = Box<dyn Fn(&Value) -> Result<Box<dyn std::any::Any + Send>, MemFlowError> + Send + Sync>;

/// Registry mapping activity names/versions to typed argument deserializers,
/// the same shape as `CommandRegistry::register`/`deserialize`.
#[derive(Default)]
pub struct ActivityRegistry {
    deserializers: HashMap<(&'static str, i32), ActivityDeserializer>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A: DeserializeOwned + Send + 'static>(
        &mut self,
        activity_name: &'static str,
        supported_versions: Vec<i32>,
    ) {
        for version in supported_versions {
            let key = (activity_name, version);
            if self.deserializers.contains_key(&key) {
                panic!("activity {activity_name} v{version} already registered");
            }
            self.deserializers.insert(
                key,
                Box::new(|value: &Value| {
                    serde_json::from_value::<A>(value.clone())
                        .map(|a| Box::new(a) as Box<dyn std::any::Any + Send>)
                        .map_err(|e| MemFlowError::Backend(anyhow::anyhow!(e)))
                }),
            );
        }
    }

    pub fn deserialize(&self, claimed: &ClaimedActivity) -> Result<Box<dyn std::any::Any + Send>, MemFlowError> {
        let key = (claimed.activity_name.as_str(), claimed.version);
        // `&'static str` keys require a static lookup; find by value match instead.
        let entry = self
            .deserializers
            .iter()
            .find(|((name, version), _)| *name == key.0 && *version == key.1);
        match entry {
            Some((_, deserializer)) => deserializer(&claimed.args),
            None => Err(MemFlowError::Backend(anyhow::anyhow!(
                "no activity registered for {} v{}",
                claimed.activity_name,
                claimed.version
            ))),
        }
    }

    pub fn has(&self, activity_name: &str, version: i32) -> bool {
        self.deserializers
            .keys()
            .any(|(name, v)| *name == activity_name && *v == version)
    }
}

/// Caller-facing handle used from within a workflow step to invoke an
/// activity. A call first checks the Journal: if the execIndex is already
/// recorded, the result returns instantly with no IO (replay); otherwise it
/// publishes the call to the worker stream (namespace-qualified, no
/// trailing colon — see [`crate::stream::stream_group_for`]) and suspends
/// until a result lands back in the Journal.
///
/// Per DESIGN.md's open-question resolution, this crate does not run
/// workflow code as a stackful fiber — the enclosing workflow function is
/// re-executed from the start on every resumption, and this suspension is
/// just "the await doesn't resolve until the Journal has an entry",
/// expressed as Rust's own async/await rather than a hand-rolled
/// continuation.
pub struct ActivityProxy<J: Journal, B: StreamBus> {
    journal: Arc<J>,
    bus: Arc<B>,
    namespace: String,
}

impl<J: Journal, B: StreamBus> ActivityProxy<J, B> {
    pub fn new(journal: Arc<J>, bus: Arc<B>, namespace: impl Into<String>) -> Self {
        Self {
            journal,
            bus,
            namespace: namespace.into(),
        }
    }

    /// The worker stream a given `task_queue`'s claims dispatch to — shares
    /// the `{namespace}.{task_queue}` naming [`crate::engine::Engine::worker_stream`]
    /// uses, so an engine and its activity proxies agree on stream names
    /// without either depending on the other.
    pub fn worker_stream(&self, task_queue: &str) -> String {
        format!("{}.{}", self.namespace, task_queue)
    }

    pub async fn call<A: Serialize, R: DeserializeOwned>(
        &self,
        job_id: &str,
        dimension: &Dimension,
        activity_name: &str,
        args: A,
        task_queue: &str,
        options: ActivityOptions,
    ) -> Result<R, MemFlowError> {
        let exec_index = self.journal.next_exec_index(job_id, dimension).await?;
        if let Some(entry) = self.journal.load_entry(job_id, dimension, exec_index).await? {
            return Self::decode_outcome(entry);
        }

        let claimed = ClaimedActivity {
            job_id: job_id.to_string(),
            dimension: dimension.clone(),
            exec_index,
            activity_name: activity_name.to_string(),
            version: 1,
            args: serde_json::to_value(args).map_err(|e| MemFlowError::Backend(anyhow::anyhow!(e)))?,
            attempt: 1,
            retry_policy: options.retry_policy,
            task_queue: task_queue.to_string(),
            not_before: None,
        };
        self.dispatch(&claimed).await?;

        // In the single-process in-memory deployment the worker loop runs
        // in this same runtime; in a durable deployment the caller task is
        // dropped here and a fresh replay picks the result up from the
        // Journal on the next tick. Either way, this method returns only
        // once the Journal has the entry — it does not busy-poll.
        Err(MemFlowError::Transient(format!(
            "activity {activity_name} dispatched at execIndex {} awaiting worker result",
            exec_index.0
        )))
    }

    /// Fire-and-forget variant (see DESIGN.md's open-question resolution):
    /// dispatches the call and immediately notarizes it as done, without
    /// ever suspending on a worker reply. Use `call` instead whenever the
    /// workflow needs the activity's return value — this method's result is
    /// always `()`, so there is nothing to observe later.
    pub async fn call_detached<A: Serialize>(
        &self,
        job_id: &str,
        dimension: &Dimension,
        activity_name: &str,
        args: A,
        task_queue: &str,
    ) -> Result<(), MemFlowError> {
        let exec_index = self.journal.next_exec_index(job_id, dimension).await?;
        if self.journal.load_entry(job_id, dimension, exec_index).await?.is_some() {
            return Ok(());
        }

        let claimed = ClaimedActivity {
            job_id: job_id.to_string(),
            dimension: dimension.clone(),
            exec_index,
            activity_name: activity_name.to_string(),
            version: 1,
            args: serde_json::to_value(args).map_err(|e| MemFlowError::Backend(anyhow::anyhow!(e)))?,
            attempt: 1,
            retry_policy: RetryPolicy::default(),
            task_queue: task_queue.to_string(),
            not_before: None,
        };
        self.dispatch(&claimed).await?;
        self.record_success(job_id, dimension, exec_index, Value::Null).await
    }

    async fn dispatch(&self, claimed: &ClaimedActivity) -> Result<(), MemFlowError> {
        let body = serde_json::to_value(claimed).map_err(|e| MemFlowError::Backend(anyhow::anyhow!(e)))?;
        self.bus.publish(&self.worker_stream(&claimed.task_queue), body).await
    }

    fn decode_outcome<R: DeserializeOwned>(entry: JournalEntry) -> Result<R, MemFlowError> {
        let outcome: ActivityOutcome = serde_json::from_value(entry.payload)
            .map_err(|e| MemFlowError::Backend(anyhow::anyhow!(e)))?;
        match outcome {
            ActivityOutcome::Success { value } => {
                serde_json::from_value(value).map_err(|e| MemFlowError::Backend(anyhow::anyhow!(e)))
            }
            ActivityOutcome::Failed { code, message, attempts } => {
                Err(Self::failure_for_code(code, message, attempts))
            }
        }
    }

    fn failure_for_code(code: i32, message: String, attempts: u32) -> MemFlowError {
        if code == FailureCode::Fatal.as_i32() {
            MemFlowError::Fatal(message)
        } else if code == FailureCode::MaxedOut.as_i32() {
            MemFlowError::MaxedOut { attempts, message }
        } else {
            MemFlowError::Backend(anyhow::anyhow!(message))
        }
    }

    /// Record the worker's successful result for a previously-dispatched
    /// activity call. Called by the Router when a completion message
    /// arrives on the engine stream; idempotent against redelivery via
    /// the Collator's duplicate check upstream of this call.
    pub async fn record_success(
        &self,
        job_id: &str,
        dimension: &Dimension,
        exec_index: ExecIndex,
        result: Value,
    ) -> Result<(), MemFlowError> {
        self.append_outcome(job_id, dimension, exec_index, ActivityOutcome::Success { value: result })
            .await
    }

    /// Record a worker-reported failure. Retryable failures are re-dispatched
    /// with the next backoff delay from `claimed.retry_policy`, unless the
    /// attempt budget is exhausted; non-retryable failures bypass retry
    /// entirely. Either exhaustion path notarizes a terminal
    /// [`MemFlowError::MaxedOut`]/[`MemFlowError::Fatal`] the next replay's
    /// `call` will return.
    pub async fn record_failure(
        &self,
        claimed: &ClaimedActivity,
        kind: FailureKind,
        message: String,
    ) -> Result<RetryOutcome, MemFlowError> {
        if kind == FailureKind::NonRetryable {
            self.append_outcome(
                &claimed.job_id,
                &claimed.dimension,
                claimed.exec_index,
                ActivityOutcome::Failed {
                    code: FailureCode::Fatal.as_i32(),
                    message,
                    attempts: claimed.attempt,
                },
            )
            .await?;
            return Ok(RetryOutcome::Terminal);
        }

        match claimed.retry_policy.next_delay(claimed.attempt) {
            Some(delay) => {
                let mut next = claimed.clone();
                next.attempt += 1;
                next.not_before = Some(
                    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
                );
                self.dispatch(&next).await?;
                Ok(RetryOutcome::Scheduled { delay })
            }
            None => {
                self.append_outcome(
                    &claimed.job_id,
                    &claimed.dimension,
                    claimed.exec_index,
                    ActivityOutcome::Failed {
                        code: FailureCode::MaxedOut.as_i32(),
                        message,
                        attempts: claimed.attempt,
                    },
                )
                .await?;
                Ok(RetryOutcome::Terminal)
            }
        }
    }

    async fn append_outcome(
        &self,
        job_id: &str,
        dimension: &Dimension,
        exec_index: ExecIndex,
        outcome: ActivityOutcome,
    ) -> Result<(), MemFlowError> {
        let payload =
            serde_json::to_value(&outcome).map_err(|e| MemFlowError::Backend(anyhow::anyhow!(e)))?;
        self.journal
            .append_entry(JournalEntry {
                job_id: job_id.to_string(),
                dimension: dimension.clone(),
                exec_index,
                kind: JournalEntryKind::ActivityCall,
                payload,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::InMemoryJournal;
    use crate::stream::InMemoryStreamBus;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct SendEmailArgs {
        to: String,
    }

    #[tokio::test]
    async fn registry_deserializes_registered_version() {
        let mut registry = ActivityRegistry::new();
        registry.register::<SendEmailArgs>("email.send", vec![1]);
        let claimed = ClaimedActivity {
            job_id: "job-1".into(),
            dimension: Dimension::root(),
            exec_index: ExecIndex::ZERO,
            activity_name: "email.send".into(),
            version: 1,
            args: serde_json::json!({ "to": "a@example.com" }),
            attempt: 1,
            retry_policy: RetryPolicy::default(),
            task_queue: "queue".into(),
            not_before: None,
        };
        let decoded = registry.deserialize(&claimed).unwrap();
        let args = decoded.downcast::<SendEmailArgs>().unwrap();
        assert_eq!(args.to, "a@example.com");
    }

    #[tokio::test]
    async fn first_call_suspends_then_replay_returns_journaled_result() {
        let journal = Arc::new(InMemoryJournal::new());
        let bus = Arc::new(InMemoryStreamBus::new());
        let proxy = ActivityProxy::new(journal.clone(), bus.clone(), "ns");
        let dim = Dimension::root();

        let first: Result<String, _> = proxy
            .call(
                "job-1",
                &dim,
                "email.send",
                SendEmailArgs { to: "a".into() },
                "queue",
                ActivityOptions::default(),
            )
            .await;
        assert!(matches!(first, Err(MemFlowError::Transient(_))));
        assert_eq!(bus.depth("ns.queue").await.unwrap(), 1);

        proxy
            .record_success("job-1", &dim, ExecIndex::ZERO, Value::from("sent"))
            .await
            .unwrap();

        let replayed: String = proxy
            .call(
                "job-1",
                &dim,
                "email.send",
                SendEmailArgs { to: "a".into() },
                "queue",
                ActivityOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(replayed, "sent");
    }

    #[tokio::test]
    async fn call_detached_never_suspends_and_replays_as_done() {
        let journal = Arc::new(InMemoryJournal::new());
        let bus = Arc::new(InMemoryStreamBus::new());
        let proxy = ActivityProxy::new(journal.clone(), bus.clone(), "ns");
        let dim = Dimension::root();

        proxy
            .call_detached("job-1", &dim, "email.send", SendEmailArgs { to: "a".into() }, "queue")
            .await
            .unwrap();
        assert_eq!(bus.depth("ns.queue").await.unwrap(), 1);

        // Replay finds the entry already journaled and does not redispatch.
        proxy
            .call_detached("job-1", &dim, "email.send", SendEmailArgs { to: "a".into() }, "queue")
            .await
            .unwrap();
        assert_eq!(bus.depth("ns.queue").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_fatal_on_replay() {
        let journal = Arc::new(InMemoryJournal::new());
        let bus = Arc::new(InMemoryStreamBus::new());
        let proxy = ActivityProxy::new(journal.clone(), bus.clone(), "ns");
        let dim = Dimension::root();

        let claimed = ClaimedActivity {
            job_id: "job-1".into(),
            dimension: dim.clone(),
            exec_index: ExecIndex::ZERO,
            activity_name: "email.send".into(),
            version: 1,
            args: Value::Null,
            attempt: 1,
            retry_policy: RetryPolicy::default(),
            task_queue: "queue".into(),
            not_before: None,
        };
        let outcome = proxy
            .record_failure(&claimed, FailureKind::NonRetryable, "stop-retrying-please".into())
            .await
            .unwrap();
        assert_eq!(outcome, RetryOutcome::Terminal);

        let replayed: Result<String, _> = proxy
            .call("job-1", &dim, "email.send", Value::Null, "queue", ActivityOptions::default())
            .await;
        assert!(matches!(replayed, Err(MemFlowError::Fatal(m)) if m == "stop-retrying-please"));
    }

    #[tokio::test]
    async fn retryable_failure_reschedules_until_budget_exhausted_then_maxed_out() {
        let journal = Arc::new(InMemoryJournal::new());
        let bus = Arc::new(InMemoryStreamBus::new());
        let proxy = ActivityProxy::new(journal.clone(), bus.clone(), "ns");
        let dim = Dimension::root();
        let policy = RetryPolicy {
            maximum_attempts: 2,
            backoff_coefficient: 2.0,
            initial_interval: std::time::Duration::from_secs(1),
            maximum_interval: std::time::Duration::from_secs(60),
        };
        let claimed = ClaimedActivity {
            job_id: "job-1".into(),
            dimension: dim.clone(),
            exec_index: ExecIndex::ZERO,
            activity_name: "flaky".into(),
            version: 1,
            args: Value::Null,
            attempt: 1,
            retry_policy: policy,
            task_queue: "queue".into(),
            not_before: None,
        };

        let first = proxy
            .record_failure(&claimed, FailureKind::Retryable, "recurring-test-error".into())
            .await
            .unwrap();
        assert!(matches!(first, RetryOutcome::Scheduled { .. }));
        assert_eq!(bus.depth("ns.queue").await.unwrap(), 1);
        // Not yet journaled as terminal — replay would still suspend.
        assert!(journal
            .load_entry("job-1", &dim, ExecIndex::ZERO)
            .await
            .unwrap()
            .is_none());

        let mut retried = claimed.clone();
        retried.attempt = 2;
        let second = proxy
            .record_failure(&retried, FailureKind::Retryable, "recurring-test-error".into())
            .await
            .unwrap();
        assert_eq!(second, RetryOutcome::Terminal);

        let replayed: Result<String, _> = proxy
            .call("job-1", &dim, "flaky", Value::Null, "queue", ActivityOptions::default())
            .await;
        assert!(matches!(
            replayed,
            Err(MemFlowError::MaxedOut { attempts: 2, message }) if message == "recurring-test-error"
        ));
    }
}
