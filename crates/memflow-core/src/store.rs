//! The Store: a backend-agnostic transactional key/value and hash surface
//! that every other component — Journal, Entity, the job/status semaphore —
//! is ultimately built on top of.
//!
//! Grounded on `persistence.rs`'s `MachineStore`/`Revision`/`StoreError`:
//! the same optimistic-concurrency CAS (`save(key, value, expected)` fails
//! with `StoreError::Conflict` on a stale revision) generalized from a
//! single machine snapshot row to an arbitrary key/hash surface, plus
//! `job.rs`'s `JobStore` claim-style access for the stream-adjacent reads.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::MemFlowError;

/// Optimistic-concurrency revision, `0` meaning "does not exist yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision(pub u64);

impl Revision {
    pub const NONE: Revision = Revision(0);

    pub fn next(self) -> Revision {
        Revision(self.0.saturating_add(1))
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 == 0 {
            write!(f, "NONE")
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

/// A key minted from `(namespace, appId, jobId, field)`, matching the
/// external interface's convention for sanitized, stable storage keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey(String);

impl StoreKey {
    pub fn new(namespace: &str, app_id: &str, job_id: &str, field: &str) -> Self {
        let ns = crate::util::sanitize_app_id(namespace);
        let app = crate::util::sanitize_app_id(app_id);
        StoreKey(format!("{ns}:{app}:{job_id}:{field}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split a key back into its `(namespace, app_id, job_id, field)`
    /// components. `job_id` never contains `:` ([`crate::util::guid`]
    /// produces only alphanumerics), so a 4-way split is unambiguous.
    pub fn parts(&self) -> (&str, &str, &str, &str) {
        let mut it = self.0.splitn(4, ':');
        let namespace = it.next().unwrap_or_default();
        let app_id = it.next().unwrap_or_default();
        let job_id = it.next().unwrap_or_default();
        let field = it.next().unwrap_or_default();
        (namespace, app_id, job_id, field)
    }
}

/// A single write queued in a [`Transaction`].
#[derive(Debug, Clone)]
pub enum StoreOp {
    Set { key: StoreKey, value: Value },
    HSet { key: StoreKey, field: String, value: Value },
    HIncrBy { key: StoreKey, field: String, amount: i64 },
    Delete { key: StoreKey },
}

/// A batch of writes applied atomically. The Store's single-transaction
/// commit requirement (state write + status update + outbound publish, all
/// or nothing) is expressed here — backends that front a real database
/// execute the whole batch in one SQL transaction; the in-memory backend
/// applies it under one lock acquisition with no intervening await points.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    ops: Vec<StoreOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: StoreKey, value: Value) -> Self {
        self.ops.push(StoreOp::Set { key, value });
        self
    }

    pub fn hset(mut self, key: StoreKey, field: impl Into<String>, value: Value) -> Self {
        self.ops.push(StoreOp::HSet {
            key,
            field: field.into(),
            value,
        });
        self
    }

    pub fn hincr_by(mut self, key: StoreKey, field: impl Into<String>, amount: i64) -> Self {
        self.ops.push(StoreOp::HIncrBy {
            key,
            field: field.into(),
            amount,
        });
        self
    }

    pub fn delete(mut self, key: StoreKey) -> Self {
        self.ops.push(StoreOp::Delete { key });
        self
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &StoreKey) -> Result<Option<Value>, MemFlowError>;

    /// Read a value together with the revision a subsequent `set_if` must
    /// present to replace it. Entity's read-modify-write loop (deep-merge,
    /// increment, toggle, …) is built entirely on this plus `set_if`.
    async fn get_with_revision(
        &self,
        key: &StoreKey,
    ) -> Result<(Option<Value>, Revision), MemFlowError>;

    async fn set_if(
        &self,
        key: &StoreKey,
        value: Value,
        expected: Revision,
    ) -> Result<Revision, MemFlowError>;

    async fn hget(&self, key: &StoreKey, field: &str) -> Result<Option<Value>, MemFlowError>;

    async fn hgetall(&self, key: &StoreKey) -> Result<HashMap<String, Value>, MemFlowError>;

    /// Apply a transaction atomically. Returns the new revision of `key` if
    /// the transaction touched it via `Set`.
    async fn commit(&self, txn: Transaction) -> Result<(), MemFlowError>;
}

/// In-memory `Store` for tests and the single-process deployment mode.
/// Mirrors `persistence::testing::InMemoryStore`'s CAS-on-revision-mismatch
/// behavior, extended with the hash operations Entity/Journal need.
#[derive(Default)]
pub struct InMemoryStore {
    values: Mutex<HashMap<String, (Value, Revision)>>,
    hashes: Mutex<HashMap<String, HashMap<String, Value>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, key: &StoreKey) -> Result<Option<Value>, MemFlowError> {
        let values = self.values.lock().expect("store mutex poisoned");
        Ok(values.get(key.as_str()).map(|(v, _)| v.clone()))
    }

    async fn get_with_revision(
        &self,
        key: &StoreKey,
    ) -> Result<(Option<Value>, Revision), MemFlowError> {
        let values = self.values.lock().expect("store mutex poisoned");
        match values.get(key.as_str()) {
            Some((v, r)) => Ok((Some(v.clone()), *r)),
            None => Ok((None, Revision::NONE)),
        }
    }

    async fn set_if(
        &self,
        key: &StoreKey,
        value: Value,
        expected: Revision,
    ) -> Result<Revision, MemFlowError> {
        let mut values = self.values.lock().expect("store mutex poisoned");
        let current_rev = values
            .get(key.as_str())
            .map(|(_, r)| *r)
            .unwrap_or(Revision::NONE);
        if current_rev != expected {
            return Err(MemFlowError::StoreConflict);
        }
        let next = current_rev.next();
        values.insert(key.as_str().to_string(), (value, next));
        Ok(next)
    }

    async fn hget(&self, key: &StoreKey, field: &str) -> Result<Option<Value>, MemFlowError> {
        let hashes = self.hashes.lock().expect("store mutex poisoned");
        Ok(hashes
            .get(key.as_str())
            .and_then(|fields| fields.get(field))
            .cloned())
    }

    async fn hgetall(&self, key: &StoreKey) -> Result<HashMap<String, Value>, MemFlowError> {
        let hashes = self.hashes.lock().expect("store mutex poisoned");
        Ok(hashes.get(key.as_str()).cloned().unwrap_or_default())
    }

    async fn commit(&self, txn: Transaction) -> Result<(), MemFlowError> {
        let mut values = self.values.lock().expect("store mutex poisoned");
        let mut hashes = self.hashes.lock().expect("store mutex poisoned");
        for op in txn.ops() {
            match op {
                StoreOp::Set { key, value } => {
                    let next = values
                        .get(key.as_str())
                        .map(|(_, r)| r.next())
                        .unwrap_or(Revision::NONE.next());
                    values.insert(key.as_str().to_string(), (value.clone(), next));
                }
                StoreOp::HSet { key, field, value } => {
                    hashes
                        .entry(key.as_str().to_string())
                        .or_default()
                        .insert(field.clone(), value.clone());
                }
                StoreOp::HIncrBy { key, field, amount } => {
                    let fields = hashes.entry(key.as_str().to_string()).or_default();
                    let current = fields
                        .get(field)
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    fields.insert(field.clone(), Value::from(current + amount));
                }
                StoreOp::Delete { key } => {
                    values.remove(key.as_str());
                    hashes.remove(key.as_str());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_rejects_stale_revision() {
        let store = InMemoryStore::new();
        let key = StoreKey::new("ns", "app", "job-1", "state");
        let rev1 = store
            .set_if(&key, Value::from("a"), Revision::NONE)
            .await
            .unwrap();
        assert_eq!(rev1, Revision(1));

        let err = store.set_if(&key, Value::from("b"), Revision::NONE).await;
        assert!(matches!(err, Err(MemFlowError::StoreConflict)));

        let rev2 = store.set_if(&key, Value::from("b"), rev1).await.unwrap();
        assert_eq!(rev2, Revision(2));
        assert_eq!(store.get(&key).await.unwrap(), Some(Value::from("b")));
    }

    #[tokio::test]
    async fn get_with_revision_reports_none_revision() {
        let store = InMemoryStore::new();
        let key = StoreKey::new("ns", "app", "job-1", "udata");
        assert_eq!(
            store.get_with_revision(&key).await.unwrap(),
            (None, Revision::NONE)
        );
        let rev = store
            .set_if(&key, Value::from("a"), Revision::NONE)
            .await
            .unwrap();
        assert_eq!(
            store.get_with_revision(&key).await.unwrap(),
            (Some(Value::from("a")), rev)
        );
    }

    #[test]
    fn store_key_parts_round_trip() {
        let key = StoreKey::new("My-NS", "app one", "job-1", "udata");
        let (ns, app, job, field) = key.parts();
        assert_eq!(job, "job-1");
        assert_eq!(field, "udata");
        assert_eq!(ns, "my_ns");
        assert_eq!(app, "app_one");
    }

    #[tokio::test]
    async fn transaction_applies_all_ops_atomically() {
        let store = InMemoryStore::new();
        let key = StoreKey::new("ns", "app", "job-1", "status");
        let txn = Transaction::new()
            .hset(key.clone(), "count", Value::from(0))
            .hincr_by(key.clone(), "count", 5);
        store.commit(txn).await.unwrap();
        assert_eq!(
            store.hget(&key, "count").await.unwrap(),
            Some(Value::from(5))
        );
    }
}
