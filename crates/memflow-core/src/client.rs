//! The Client & Handle: the external API surface — start, signal,
//! interrupt, result, search, and the parent-context `hook` entry point.
//!
//! Grounded on `request.rs`'s `dispatch_request`/`dispatch_request_timeout`
//! (correlation-keyed await-with-timeout sugar over the event bus),
//! generalized here from "await one matching event" to "poll the job's
//! terminal status transition" — the same 30-second default timeout that
//! reference's request/response sugar uses is kept as
//! [`DEFAULT_RESULT_TIMEOUT`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::collator::Collator;
use crate::engine::{Engine, InterruptOptions};
use crate::entity::Entity;
use crate::error::{MemFlowError, RetryPolicy};
use crate::journal::Journal;
use crate::scheduler::Scheduler;
use crate::search::SearchIndex;
use crate::store::Store;
use crate::stream::StreamBus;
use crate::util;

/// Matches `request.rs`'s `DEFAULT_REQUEST_TIMEOUT`, carried over to the
/// durable-result wait since both express "how long a caller will await a
/// correlated outcome before giving up."
pub const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(30);

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct WorkflowStartOptions {
    pub args: Value,
    pub task_queue: String,
    pub workflow_name: String,
    pub workflow_id: Option<String>,
    pub entity: Option<Value>,
    pub expire: Option<Duration>,
    pub signal_in: Option<(String, Value)>,
    pub config: Option<RetryPolicy>,
}

impl WorkflowStartOptions {
    pub fn new(workflow_name: impl Into<String>, task_queue: impl Into<String>, args: Value) -> Self {
        Self {
            args,
            task_queue: task_queue.into(),
            workflow_name: workflow_name.into(),
            workflow_id: None,
            entity: None,
            expire: None,
            signal_in: None,
            config: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResultOptions {
    pub timeout: Option<Duration>,
    /// `state`-only mode: don't error on interrupt, just report whatever
    /// status/value is currently recorded.
    pub state: bool,
}

/// Client entry point: `client.workflow.start/hook/search` in the external
/// interface's naming. One `Client` is shared across a namespace.
pub struct Client<S: Store, B: StreamBus, J: Journal> {
    engine: Arc<Engine<S, B, J>>,
    scheduler: Arc<Scheduler>,
    store: Arc<S>,
    namespace: String,
}

impl<S: Store, B: StreamBus, J: Journal> Client<S, B, J> {
    pub fn new(
        engine: Arc<Engine<S, B, J>>,
        scheduler: Arc<Scheduler>,
        store: Arc<S>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            scheduler,
            store,
            namespace: namespace.into(),
        }
    }

    /// `client.workflow.start(...)`: publishes one "start" message and
    /// returns a `Handle` bound to the resulting `workflowId`.
    pub async fn start(&self, options: WorkflowStartOptions) -> Result<Handle<S, B, J>, MemFlowError> {
        let job_id = options.workflow_id.unwrap_or_else(util::guid);
        self.engine
            .start_job(
                &options.task_queue,
                &job_id,
                &options.workflow_name,
                options.args,
                options.config,
                options.expire,
            )
            .await?;

        if let Some(entity) = options.entity {
            let entity_handle = Entity::new(self.store.clone(), &self.namespace, &options.task_queue, &job_id);
            entity_handle.set(entity).await?;
        }
        if let Some((signal_id, payload)) = options.signal_in {
            self.scheduler.record_signal(&job_id, &signal_id, payload);
        }

        Ok(Handle {
            engine: self.engine.clone(),
            scheduler: self.scheduler.clone(),
            store: self.store.clone(),
            namespace: self.namespace.clone(),
            task_queue: options.task_queue,
            job_id,
        })
    }

    pub fn handle(&self, task_queue: impl Into<String>, job_id: impl Into<String>) -> Handle<S, B, J> {
        Handle {
            engine: self.engine.clone(),
            scheduler: self.scheduler.clone(),
            store: self.store.clone(),
            namespace: self.namespace.clone(),
            task_queue: task_queue.into(),
            job_id: job_id.into(),
        }
    }

    /// `client.workflow.hook(...)`: runs `f` against the parent job's
    /// entity, sharing its memory rather than starting a new job.
    pub fn hook(&self, task_queue: &str, parent_job_id: &str) -> Entity<S> {
        Entity::new(self.store.clone(), &self.namespace, task_queue, parent_job_id)
    }

    /// `client.workflow.search(...)`: delegates to `SearchIndex`.
    pub fn search(&self) -> SearchIndex<S> {
        SearchIndex::new(self.store.clone())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

/// Handle bound to one running (or finished) workflow id.
pub struct Handle<S: Store, B: StreamBus, J: Journal> {
    engine: Arc<Engine<S, B, J>>,
    scheduler: Arc<Scheduler>,
    store: Arc<S>,
    namespace: String,
    task_queue: String,
    job_id: String,
}

impl<S: Store, B: StreamBus, J: Journal> Handle<S, B, J> {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Await the job's terminal transition. Polls the status semaphore at
    /// `RESULT_POLL_INTERVAL` until it reaches zero (done) or the
    /// interrupted sentinel, or `options.timeout` (default
    /// [`DEFAULT_RESULT_TIMEOUT`]) elapses.
    pub async fn result(&self, options: ResultOptions) -> Result<Value, MemFlowError> {
        let timeout = options.timeout.unwrap_or(DEFAULT_RESULT_TIMEOUT);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.engine.status(&self.task_queue, &self.job_id).await?;
            if Engine::<S, B, J>::is_interrupted(status) {
                if options.state {
                    return Ok(Value::Null);
                }
                return Err(MemFlowError::Interrupted);
            }
            if Engine::<S, B, J>::is_done(status) {
                return Ok(self
                    .engine
                    .jdata(&self.task_queue, &self.job_id)
                    .await?
                    .unwrap_or(Value::Null));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MemFlowError::Timeout(timeout));
            }
            tokio::time::sleep(RESULT_POLL_INTERVAL).await;
        }
    }

    /// `handle.signal(signalId, payload)`: delivers a signal, storing it
    /// immediately so a `waitFor` that hasn't started yet still observes it
    /// once it does (signal-before-wait semantics), and wakes a live
    /// engine loop via the engine stream.
    pub async fn signal(&self, signal_id: &str, payload: Value) -> Result<(), MemFlowError> {
        self.scheduler.record_signal(&self.job_id, signal_id, payload.clone());
        self.engine
            .publish_signal(&self.task_queue, &self.job_id, signal_id, payload)
            .await
    }

    pub async fn interrupt(&self, options: InterruptOptions) -> Result<(), MemFlowError> {
        self.engine.interrupt(&self.task_queue, &self.job_id, options).await
    }

    /// `handle.state(includeJs?)`: current status, and the `jdata` value
    /// (`js` in the external interface) if `include_js` is set.
    pub async fn state(&self, include_js: bool) -> Result<Value, MemFlowError> {
        let status = self.engine.status(&self.task_queue, &self.job_id).await?;
        let mut state = serde_json::json!({ "status": status, "job_id": self.job_id });
        if include_js {
            let js = self.engine.jdata(&self.task_queue, &self.job_id).await?;
            state["js"] = js.unwrap_or(Value::Null);
        }
        Ok(state)
    }

    /// `handle.export(opts)`: raw dump of the job's attribute hash.
    pub async fn export(&self) -> Result<Value, MemFlowError> {
        let key = self.engine.job_key(&self.task_queue, &self.job_id);
        let fields = self.store.hgetall(&key).await?;
        Ok(Value::Object(fields.into_iter().collect()))
    }

    pub fn collator(&self, journal: Arc<J>) -> Collator<J> {
        Collator::new(journal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::InMemoryJournal;
    use crate::store::InMemoryStore;
    use crate::stream::InMemoryStreamBus;

    fn client() -> Client<InMemoryStore, InMemoryStreamBus, InMemoryJournal> {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryStreamBus::new());
        let journal = Arc::new(InMemoryJournal::new());
        let engine = Arc::new(Engine::new(store.clone(), bus, journal, "ns"));
        let scheduler = Arc::new(Scheduler::new());
        Client::new(engine, scheduler, store, "ns")
    }

    #[tokio::test]
    async fn start_then_result_reports_done_once_job_completes() {
        let client = client();
        let handle = client
            .start(WorkflowStartOptions::new("example", "q", Value::from("HotMesh")))
            .await
            .unwrap();

        // Simulate the engine finishing the job's single open leg.
        client
            .engine
            .commit_leg2("q", handle.job_id(), Some(serde_json::json!({"ok": true})))
            .await
            .unwrap();

        let result = handle
            .result(ResultOptions {
                timeout: Some(Duration::from_millis(200)),
                state: false,
            })
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn result_times_out_while_job_still_open() {
        let client = client();
        let handle = client
            .start(WorkflowStartOptions::new("example", "q", Value::Null))
            .await
            .unwrap();

        let err = handle
            .result(ResultOptions {
                timeout: Some(Duration::from_millis(50)),
                state: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MemFlowError::Timeout(_)));
    }

    #[tokio::test]
    async fn interrupt_makes_result_throw_unless_state_mode() {
        let client = client();
        let handle = client
            .start(WorkflowStartOptions::new("example", "q", Value::Null))
            .await
            .unwrap();
        handle
            .interrupt(InterruptOptions {
                descend: false,
                expire: None,
                throw: true,
            })
            .await
            .unwrap();

        let err = handle
            .result(ResultOptions {
                timeout: Some(Duration::from_millis(100)),
                state: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MemFlowError::Interrupted));
    }

    #[tokio::test]
    async fn signal_is_observable_by_scheduler_before_or_after_wait() {
        let client = client();
        let handle = client
            .start(WorkflowStartOptions::new("example", "q", Value::Null))
            .await
            .unwrap();
        handle.signal("approve", Value::from(true)).await.unwrap();
        let stored = client.scheduler.take_signal(handle.job_id(), "approve");
        assert_eq!(stored.unwrap().payload, Value::from(true));
    }

    #[tokio::test]
    async fn hook_shares_parent_entity() {
        let client = client();
        let handle = client
            .start(WorkflowStartOptions::new("example", "q", Value::Null))
            .await
            .unwrap();
        let entity = client.hook("q", handle.job_id());
        entity.set(serde_json::json!({"from_hook": true})).await.unwrap();
        let direct = Entity::new(client.store.clone(), client.namespace(), "q", handle.job_id());
        assert_eq!(direct.get().await.unwrap(), serde_json::json!({"from_hook": true}));
    }
}
