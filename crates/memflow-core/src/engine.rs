//! The Engine: executes a workflow step, interprets its replay tape, and
//! commits the leg transition that makes the step durable.
//!
//! A workflow step moves a job through `PENDING → LEG1_COMMITTED →
//! SUSPENDED → LEG2_COMMITTED → DONE`. `status` is a signed-integer
//! semaphore on the job's store row: each leg that opens increments it,
//! each leg that closes decrements it. `status == 0` means the job is
//! fully done; `status <= JobStatus::INTERRUPTED_SENTINEL` means it was
//! forced terminal by [`Engine::interrupt`].
//!
//! Grounded on the same optimistic-concurrency shape the Store/Journal/
//! Entity all share (`persistence.rs`'s load-before-decide,
//! save-before-dispatch contract): a leg transition is "durable" exactly
//! when its `Store::commit` has returned, and nothing downstream (a stream
//! publish, a journal append) is allowed to be observed before that.

use std::sync::Arc;

use serde_json::Value;

use crate::collator::{Collator, LegRef};
use crate::error::MemFlowError;
use crate::journal::{Dimension, ExecIndex, Journal, JournalEntry, JournalEntryKind};
use crate::store::{Store, StoreKey, Transaction};
use crate::stream::StreamBus;

/// Interrupted jobs carry a status at or below this sentinel, per the
/// external interface ("large negative, ≤ −1,000,000").
pub const INTERRUPTED_SENTINEL: i64 = -1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegState {
    Pending,
    Leg1Committed,
    Suspended,
    Leg2Committed,
    Done,
}

/// Options accepted by [`Engine::interrupt`], matching the external API's
/// `interrupt(jobId, {descend, expire, throw})`.
#[derive(Debug, Clone, Copy)]
pub struct InterruptOptions {
    pub descend: bool,
    pub expire: Option<std::time::Duration>,
    /// Whether `handle.result()` should surface `HMSH_CODE_INTERRUPT` (410)
    /// to the caller. Read by the Client; the Engine itself always records
    /// the interrupt regardless of this flag.
    pub throw: bool,
}

impl Default for InterruptOptions {
    fn default() -> Self {
        Self {
            descend: false,
            expire: None,
            throw: true,
        }
    }
}

pub struct Engine<S: Store, B: StreamBus, J: Journal> {
    store: Arc<S>,
    bus: Arc<B>,
    journal: Arc<J>,
    collator: Collator<J>,
    namespace: String,
}

impl<S: Store, B: StreamBus, J: Journal> Engine<S, B, J> {
    pub fn new(store: Arc<S>, bus: Arc<B>, journal: Arc<J>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            bus,
            collator: Collator::new(journal.clone()),
            journal,
            namespace: namespace.into(),
        }
    }

    pub fn job_key(&self, task_queue: &str, job_id: &str) -> StoreKey {
        StoreKey::new(&self.namespace, task_queue, job_id, "job")
    }

    /// The engine-side stream for `task_queue`: ends in a bare `:`, which
    /// is what [`crate::stream::stream_group_for`] uses to classify it as
    /// ENGINE rather than WORKER.
    pub fn engine_stream(&self, task_queue: &str) -> String {
        format!("{}.{}:", self.namespace, task_queue)
    }

    /// The worker-side stream for `task_queue` — no trailing colon, so
    /// [`crate::stream::stream_group_for`] classifies it as WORKER. This is
    /// the stream [`crate::activity::ActivityProxy::dispatch`] publishes to
    /// when constructed with the same namespace.
    pub fn worker_stream(&self, task_queue: &str) -> String {
        format!("{}.{}", self.namespace, task_queue)
    }

    /// Create a job at `status = 1` (one open leg: the workflow's main
    /// body) and publish the "start" message that a Router-driven handler
    /// picks up to begin execution. `retry_policy`, if given, is the
    /// `config?:RetryPolicy` the external interface accepts at start time —
    /// the workflow's default for activity calls that don't pick their own
    /// via `ActivityOptions`; read back with [`Engine::retry_policy`].
    /// `expire`, if given, is the job's `expireAt` (relative to now),
    /// persisted so the external `prune()` housekeeping function can find
    /// and soft-delete the job once it passes; read back with
    /// [`Engine::expire_at`].
    pub async fn start_job(
        &self,
        task_queue: &str,
        job_id: &str,
        workflow_name: &str,
        args: Value,
        retry_policy: Option<crate::error::RetryPolicy>,
        expire: Option<std::time::Duration>,
    ) -> Result<(), MemFlowError> {
        let key = self.job_key(task_queue, job_id);
        let mut txn = Transaction::new()
            .hset(key.clone(), "status", Value::from(1))
            .hset(key.clone(), "workflow_name", Value::from(workflow_name))
            .hset(key.clone(), "children", Value::Array(Vec::new()));
        if let Some(policy) = retry_policy {
            let encoded = serde_json::to_value(policy).map_err(|e| MemFlowError::Backend(anyhow::anyhow!(e)))?;
            txn = txn.hset(key.clone(), "retry_policy", encoded);
        }
        if let Some(expire) = expire {
            txn = txn.hset(key, "expire_at", Self::expire_at_value(expire));
        }
        self.store.commit(txn).await?;

        let body = serde_json::json!({
            "type": "start",
            "job_id": job_id,
            "workflow_name": workflow_name,
            "args": args,
        });
        self.bus.publish(&self.engine_stream(task_queue), body).await?;
        Ok(())
    }

    fn expire_at_value(expire: std::time::Duration) -> Value {
        let at = chrono::Utc::now()
            + chrono::Duration::from_std(expire).unwrap_or_else(|_| chrono::Duration::zero());
        Value::from(at.to_rfc3339())
    }

    /// The job's `expireAt`, if one was set via `WorkflowStartOptions::expire`
    /// at start time or forced by a later [`Engine::interrupt`] call.
    pub async fn expire_at(
        &self,
        task_queue: &str,
        job_id: &str,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>, MemFlowError> {
        let key = self.job_key(task_queue, job_id);
        match self.store.hget(&key, "expire_at").await? {
            Some(value) => Ok(value
                .as_str()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc))),
            None => Ok(None),
        }
    }

    /// The workflow's default retry policy, if one was set via
    /// `WorkflowStartOptions::config` at start time.
    pub async fn retry_policy(
        &self,
        task_queue: &str,
        job_id: &str,
    ) -> Result<Option<crate::error::RetryPolicy>, MemFlowError> {
        let key = self.job_key(task_queue, job_id);
        match self.store.hget(&key, "retry_policy").await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| MemFlowError::Backend(anyhow::anyhow!(e))),
            None => Ok(None),
        }
    }

    pub async fn status(&self, task_queue: &str, job_id: &str) -> Result<i64, MemFlowError> {
        let key = self.job_key(task_queue, job_id);
        Ok(self
            .store
            .hget(&key, "status")
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0))
    }

    pub async fn jdata(&self, task_queue: &str, job_id: &str) -> Result<Option<Value>, MemFlowError> {
        let key = self.job_key(task_queue, job_id);
        self.store.hget(&key, "jdata").await
    }

    pub fn is_done(status: i64) -> bool {
        status == 0
    }

    pub fn is_interrupted(status: i64) -> bool {
        status <= INTERRUPTED_SENTINEL
    }

    /// Leg 1: the pre-suspension half of a step. Notarizes the journal
    /// entry, increments the semaphore for the leg that is about to
    /// suspend, and publishes the outbound stream message — in that order,
    /// atomically from the caller's point of view: if notarization fails
    /// because this leg was already committed (a duplicate redelivery),
    /// nothing else runs and the error is `is_silent()`.
    pub async fn commit_leg1(
        &self,
        task_queue: &str,
        job_id: &str,
        dimension: &Dimension,
        exec_index: ExecIndex,
        kind: JournalEntryKind,
        payload: Value,
        outbound: Option<(&str, Value)>,
    ) -> Result<(), MemFlowError> {
        let leg = LegRef {
            job_id: job_id.to_string(),
            dimension: dimension.clone(),
            exec_index,
        };
        self.collator
            .notarize_leg1_completion(&leg, kind, payload)
            .await?;

        let key = self.job_key(task_queue, job_id);
        let txn = Transaction::new().hincr_by(key, "status", 1);
        self.store.commit(txn).await?;

        if let Some((stream, body)) = outbound {
            self.bus.publish(stream, body).await?;
        }
        tracing::debug!(job_id, exec_index = exec_index.0, %dimension, "leg1 committed");
        Ok(())
    }

    /// Leg 2: applied on resumption (activity result landed, timer fired,
    /// signal arrived). Decrements the semaphore; when it reaches zero the
    /// job is fully done and `result` becomes its `jdata`.
    pub async fn commit_leg2(
        &self,
        task_queue: &str,
        job_id: &str,
        result: Option<Value>,
    ) -> Result<LegState, MemFlowError> {
        let key = self.job_key(task_queue, job_id);
        let txn = Transaction::new().hincr_by(key.clone(), "status", -1);
        self.store.commit(txn).await?;

        let status = self.status(task_queue, job_id).await?;
        if let Some(result) = result {
            let txn = Transaction::new().hset(key, "jdata", result);
            self.store.commit(txn).await?;
        }

        tracing::debug!(job_id, status, "leg2 committed");
        if Self::is_done(status) {
            Ok(LegState::Done)
        } else {
            Ok(LegState::Leg2Committed)
        }
    }

    /// Record that `child_job_id` was started from `parent_job_id`, so an
    /// `interrupt(..., {descend: true})` on the parent can cascade.
    pub async fn record_child(
        &self,
        task_queue: &str,
        parent_job_id: &str,
        child_job_id: &str,
    ) -> Result<(), MemFlowError> {
        let key = self.job_key(task_queue, parent_job_id);
        let mut children = self
            .store
            .hget(&key, "children")
            .await?
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        children.push(Value::from(child_job_id));
        let txn = Transaction::new().hset(key, "children", Value::Array(children));
        self.store.commit(txn).await
    }

    /// Start a child workflow and suspend until its result is journaled —
    /// the same replay-aware two-step [`crate::activity::ActivityProxy::call`]
    /// uses for activities, except the "worker" on the other end is another
    /// job's engine stream rather than out-of-process activity code. A call
    /// whose execIndex is already journaled (the child has finished and
    /// [`Engine::record_child_result`] ran) returns the result directly,
    /// with no IO.
    pub async fn call_child<R: serde::de::DeserializeOwned>(
        &self,
        task_queue: &str,
        job_id: &str,
        dimension: &Dimension,
        child_task_queue: &str,
        workflow_name: &str,
        args: Value,
    ) -> Result<R, MemFlowError> {
        let exec_index = self.journal.next_exec_index(job_id, dimension).await?;
        if let Some(entry) = self.journal.load_entry(job_id, dimension, exec_index).await? {
            return serde_json::from_value(entry.payload).map_err(|e| MemFlowError::Backend(anyhow::anyhow!(e)));
        }

        let child_job_id = crate::util::guid();
        self.start_job(child_task_queue, &child_job_id, workflow_name, args, None, None)
            .await?;
        self.record_child(task_queue, job_id, &child_job_id).await?;

        Err(MemFlowError::Transient(format!(
            "child workflow {workflow_name} started as {child_job_id} at execIndex {}, awaiting result",
            exec_index.0
        )))
    }

    /// Fire-and-forget variant: starts the child and immediately notarizes
    /// a `ChildStart` entry carrying its id, without ever suspending on its
    /// result. Mirrors [`crate::activity::ActivityProxy::call_detached`].
    /// Returns the started child's job id, replayed from the journal on
    /// subsequent calls rather than starting a second child.
    pub async fn call_child_detached(
        &self,
        task_queue: &str,
        job_id: &str,
        dimension: &Dimension,
        child_task_queue: &str,
        workflow_name: &str,
        args: Value,
    ) -> Result<String, MemFlowError> {
        let exec_index = self.journal.next_exec_index(job_id, dimension).await?;
        if let Some(entry) = self.journal.load_entry(job_id, dimension, exec_index).await? {
            return Ok(entry
                .payload
                .get("child_job_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string());
        }

        let child_job_id = crate::util::guid();
        self.start_job(child_task_queue, &child_job_id, workflow_name, args, None, None)
            .await?;
        self.record_child(task_queue, job_id, &child_job_id).await?;
        self.journal
            .append_entry(JournalEntry {
                job_id: job_id.to_string(),
                dimension: dimension.clone(),
                exec_index,
                kind: JournalEntryKind::ChildStart,
                payload: serde_json::json!({ "child_job_id": child_job_id }),
            })
            .await?;
        Ok(child_job_id)
    }

    /// Record a completed child job's result against the parent's
    /// suspended [`Engine::call_child`] — called by the Router (or, in a
    /// single-process deployment, directly) once the child reaches
    /// [`LegState::Done`]. Idempotent against redelivery: a second call at
    /// the same execIndex returns `MemFlowError::Collation`, which the
    /// Router treats as a silent duplicate.
    pub async fn record_child_result(
        &self,
        job_id: &str,
        dimension: &Dimension,
        exec_index: ExecIndex,
        result: Value,
    ) -> Result<(), MemFlowError> {
        self.journal
            .append_entry(JournalEntry {
                job_id: job_id.to_string(),
                dimension: dimension.clone(),
                exec_index,
                kind: JournalEntryKind::ChildExec,
                payload: result,
            })
            .await
    }

    /// Publish a signal-arrival notification on the engine stream so a live
    /// Router-driven loop wakes up and re-checks `Scheduler::take_signal`
    /// rather than waiting for its next poll tick.
    pub async fn publish_signal(
        &self,
        task_queue: &str,
        job_id: &str,
        signal_id: &str,
        payload: Value,
    ) -> Result<(), MemFlowError> {
        self.bus
            .publish(
                &self.engine_stream(task_queue),
                serde_json::json!({
                    "type": "signal",
                    "job_id": job_id,
                    "signal_id": signal_id,
                    "payload": payload,
                }),
            )
            .await
    }

    /// Force `job_id`'s status to the interrupted sentinel and, if
    /// `options.descend`, cascade into every recorded descendant. Always
    /// publishes an `"interrupted"` event per job; whether that is
    /// surfaced as an error to `handle.result()` is the Client's concern
    /// (`options.throw`). Iterative (not recursive) so cascade depth isn't
    /// bounded by the async call stack.
    pub async fn interrupt(
        &self,
        task_queue: &str,
        job_id: &str,
        options: InterruptOptions,
    ) -> Result<(), MemFlowError> {
        let mut pending = vec![job_id.to_string()];
        while let Some(current) = pending.pop() {
            let key = self.job_key(task_queue, &current);
            let children = self
                .store
                .hget(&key, "children")
                .await?
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default();

            let mut txn = Transaction::new().hset(key.clone(), "status", Value::from(INTERRUPTED_SENTINEL));
            if let Some(expire) = options.expire {
                txn = txn.hset(key, "expire_at", Self::expire_at_value(expire));
            }
            self.store.commit(txn).await?;

            self.bus
                .publish(
                    &self.engine_stream(task_queue),
                    serde_json::json!({"type": "interrupted", "job_id": current}),
                )
                .await?;
            tracing::info!(job_id = %current, descend = options.descend, "job interrupted");

            if options.descend {
                pending.extend(children.iter().filter_map(|v| v.as_str()).map(String::from));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::InMemoryJournal;
    use crate::store::InMemoryStore;
    use crate::stream::InMemoryStreamBus;

    fn engine() -> Engine<InMemoryStore, InMemoryStreamBus, InMemoryJournal> {
        Engine::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryStreamBus::new()),
            Arc::new(InMemoryJournal::new()),
            "ns",
        )
    }

    #[tokio::test]
    async fn start_job_opens_one_leg_and_publishes_start() {
        let engine = engine();
        engine
            .start_job("q", "job-1", "example", Value::from("HotMesh"), None, None)
            .await
            .unwrap();
        assert_eq!(engine.status("q", "job-1").await.unwrap(), 1);
        assert_eq!(engine.bus.depth("ns.q:").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn start_job_persists_retry_policy_when_given() {
        let engine = engine();
        let policy = crate::error::RetryPolicy {
            maximum_attempts: 5,
            ..Default::default()
        };
        engine
            .start_job("q", "job-1", "example", Value::Null, Some(policy), None)
            .await
            .unwrap();
        let read_back = engine.retry_policy("q", "job-1").await.unwrap();
        assert_eq!(read_back.unwrap().maximum_attempts, 5);
    }

    #[tokio::test]
    async fn retry_policy_is_none_when_start_job_omits_it() {
        let engine = engine();
        engine
            .start_job("q", "job-1", "example", Value::Null, None, None)
            .await
            .unwrap();
        assert!(engine.retry_policy("q", "job-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn leg1_then_leg2_returns_to_done_at_zero() {
        let engine = engine();
        engine
            .start_job("q", "job-1", "example", Value::Null, None, None)
            .await
            .unwrap();

        let dim = Dimension::root();
        engine
            .commit_leg1(
                "q",
                "job-1",
                &dim,
                ExecIndex::ZERO,
                JournalEntryKind::ActivityCall,
                Value::Null,
                None,
            )
            .await
            .unwrap();
        assert_eq!(engine.status("q", "job-1").await.unwrap(), 2);

        let state = engine.commit_leg2("q", "job-1", None).await.unwrap();
        assert_eq!(state, LegState::Leg2Committed);
        assert_eq!(engine.status("q", "job-1").await.unwrap(), 1);

        let state = engine
            .commit_leg2("q", "job-1", Some(Value::from("result")))
            .await
            .unwrap();
        assert_eq!(state, LegState::Done);
        assert_eq!(engine.status("q", "job-1").await.unwrap(), 0);
        assert_eq!(
            engine.jdata("q", "job-1").await.unwrap(),
            Some(Value::from("result"))
        );
    }

    #[tokio::test]
    async fn duplicate_leg1_is_silently_ignored() {
        let engine = engine();
        engine.start_job("q", "job-1", "example", Value::Null, None, None).await.unwrap();
        let dim = Dimension::root();
        engine
            .commit_leg1("q", "job-1", &dim, ExecIndex::ZERO, JournalEntryKind::Sleep, Value::Null, None)
            .await
            .unwrap();
        let err = engine
            .commit_leg1("q", "job-1", &dim, ExecIndex::ZERO, JournalEntryKind::Sleep, Value::Null, None)
            .await
            .unwrap_err();
        assert!(err.is_silent());
        // Status did not get incremented twice.
        assert_eq!(engine.status("q", "job-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn interrupt_sets_sentinel_and_cascades_to_children() {
        let engine = engine();
        engine.start_job("q", "parent", "wf", Value::Null, None, None).await.unwrap();
        engine.start_job("q", "child", "wf", Value::Null, None, None).await.unwrap();
        engine.record_child("q", "parent", "child").await.unwrap();

        engine
            .interrupt(
                "q",
                "parent",
                InterruptOptions {
                    descend: true,
                    expire: None,
                    throw: false,
                },
            )
            .await
            .unwrap();

        assert!(Engine::<InMemoryStore, InMemoryStreamBus, InMemoryJournal>::is_interrupted(
            engine.status("q", "parent").await.unwrap()
        ));
        assert!(Engine::<InMemoryStore, InMemoryStreamBus, InMemoryJournal>::is_interrupted(
            engine.status("q", "child").await.unwrap()
        ));
    }

    #[tokio::test]
    async fn start_job_persists_expire_at_when_given() {
        let engine = engine();
        engine
            .start_job(
                "q",
                "job-1",
                "example",
                Value::Null,
                None,
                Some(std::time::Duration::from_secs(600)),
            )
            .await
            .unwrap();
        let expire_at = engine.expire_at("q", "job-1").await.unwrap();
        assert!(expire_at.is_some());
        assert!(expire_at.unwrap() > chrono::Utc::now());
    }

    #[tokio::test]
    async fn call_child_suspends_then_replay_returns_journaled_result() {
        let engine = engine();
        engine.start_job("q", "parent", "wf", Value::Null, None, None).await.unwrap();
        let dim = Dimension::root();

        let first: Result<String, _> = engine
            .call_child("q", "parent", &dim, "q", "child-wf", Value::from("args"))
            .await;
        assert!(matches!(first, Err(MemFlowError::Transient(_))));

        let children = engine
            .store
            .hget(&engine.job_key("q", "parent"), "children")
            .await
            .unwrap()
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        assert_eq!(children.len(), 1);
        let child_job_id = children[0].as_str().unwrap().to_string();

        engine
            .record_child_result("parent", &dim, ExecIndex::ZERO, Value::from("child-done"))
            .await
            .unwrap();

        let replayed: String = engine
            .call_child("q", "parent", &dim, "q", "child-wf", Value::from("args"))
            .await
            .unwrap();
        assert_eq!(replayed, "child-done");
        assert_eq!(engine.status("q", &child_job_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn call_child_detached_never_suspends_and_replays_same_child_id() {
        let engine = engine();
        engine.start_job("q", "parent", "wf", Value::Null, None, None).await.unwrap();
        let dim = Dimension::root();

        let child_id = engine
            .call_child_detached("q", "parent", &dim, "q", "child-wf", Value::Null)
            .await
            .unwrap();

        let replayed_id = engine
            .call_child_detached("q", "parent", &dim, "q", "child-wf", Value::Null)
            .await
            .unwrap();
        assert_eq!(replayed_id, child_id);

        let children = engine
            .store
            .hget(&engine.job_key("q", "parent"), "children")
            .await
            .unwrap()
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        // Only started once, not once per replay.
        assert_eq!(children.len(), 1);
    }

    #[tokio::test]
    async fn interrupt_with_expire_sets_expire_at() {
        let engine = engine();
        engine
            .start_job("q", "jimbo2", "wf", Value::Null, None, None)
            .await
            .unwrap();
        engine
            .interrupt(
                "q",
                "jimbo2",
                InterruptOptions {
                    descend: false,
                    expire: Some(std::time::Duration::from_secs(600)),
                    throw: false,
                },
            )
            .await
            .unwrap();
        assert!(engine.expire_at("q", "jimbo2").await.unwrap().is_some());
    }
}
