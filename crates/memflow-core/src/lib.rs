//! # MemFlow
//!
//! A durable-execution engine: workflows are plain async functions whose
//! every externally-visible decision — an activity call, a sleep, a wait
//! for signal — is notarized in an append-only [`Journal`] before it takes
//! effect, so a crashed or redeployed worker can replay a job from its
//! journal and land on exactly the same decision it made the first time.
//!
//! ## Core Concepts
//!
//! - A [`Store`] holds the job's attribute hash (status, `jdata`, `udata`)
//!   behind an optimistic-concurrency CAS.
//! - A [`StreamBus`] carries work (`ClaimedActivity`, start/interrupt/signal
//!   notifications) between the engine side and the worker side of a task
//!   queue.
//! - A [`Journal`] records, once and only once per `(jobId, dimension,
//!   execIndex)`, what a workflow step decided — [`Collator`] enforces the
//!   "exactly once" half of that contract.
//! - [`ActivityProxy`] is the replay-aware call surface a workflow uses to
//!   invoke an activity: the first call publishes work and suspends
//!   (`Err(Transient)`); the replay after the result lands returns it
//!   directly from the journal.
//! - [`Scheduler`] tracks durable timers and signals.
//! - [`Engine`] commits the leg transitions (`PENDING → LEG1_COMMITTED →
//!   SUSPENDED → LEG2_COMMITTED → DONE`) that make a step's outcome
//!   durable, and owns interrupt/cascade.
//! - [`Router`] drives a `StreamBus` consumer loop against a
//!   [`MessageHandler`], acking, nacking, or silently dropping messages per
//!   [`Categorizable::category`].
//! - [`Entity`] is a job's shared mutable JSON document; [`SearchIndex`]
//!   answers equality/range/LIKE/IN queries over indexed entity fields.
//! - [`Client`] and [`Handle`] are the external API: start a workflow,
//!   await its result, signal it, interrupt it.
//!
//! ## Error boundary
//!
//! Every public async entry point returns [`MemFlowError`], never a raw
//! `anyhow::Error` — see [`Categorizable`] and [`JobFailed::from_error`].
//! `Collation`/`GenerationalConflict`/`InactiveJob`/`GetState` variants are
//! "silent" ([`MemFlowError::is_silent`]): expected races, not failures, and
//! a [`Router`] acks rather than nacks messages that fail with one.

mod activity;
mod audit;
mod client;
mod collator;
mod config;
mod engine;
mod entity;
mod error;
mod journal;
mod router;
mod scheduler;
mod search;
mod store;
mod stream;
mod util;

pub use activity::{
    ActivityOptions, ActivityProxy, ActivityRegistry, ClaimedActivity, FailureKind, RetryOutcome,
};
pub use audit::{AuditEntry, AuditEntryBuilder, AuditLog, AuditStats, SharedAuditLog};
pub use client::{Client, Handle, ResultOptions, WorkflowStartOptions, DEFAULT_RESULT_TIMEOUT};
pub use collator::{Collator, LegRef};
pub use config::{BackendTag, MemFlowConfig, ProviderRegistry, ProviderRegistryStats};
pub use engine::{Engine, InterruptOptions, LegState, INTERRUPTED_SENTINEL};
pub use entity::{deep_merge, get_path, set_path, Entity};
pub use error::{
    Categorizable, FailureCode, JobFailed, MemFlowError, RetryPolicy, SafeErrorCategory,
};
pub use journal::{Dimension, ExecIndex, InMemoryJournal, Journal, JournalEntry, JournalEntryKind};
pub use router::{MessageHandler, Router};
pub use scheduler::{Scheduler, StoredSignal, Timer};
pub use search::{ConditionOp, SearchHit, SearchIndex};
pub use store::{InMemoryStore, Revision, Store, StoreKey, StoreOp, Transaction};
pub use stream::{stream_group_for, ConsumeOptions, InMemoryStreamBus, StreamBus, StreamGroup, StreamMessage};
pub use util::{get_sym_key, get_sym_val, guid, parse_duration, random, sanitize_app_id, CronSchedule};

pub use async_trait::async_trait;
