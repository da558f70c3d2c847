//! SearchIndex: indexed lookup over entity fields (equality, range, LIKE,
//! IN), scoped by entity type within a namespace.
//!
//! Grounded on no single reference file (see DESIGN.md) — it generalizes the
//! `Store`/`Entity` abstractions as a query layer over the same backing
//! data, in the same trait-with-in-memory-impl shape `persistence.rs` uses
//! for `MachineStore`. A snapshot of a job's indexed fields is written into
//! a per-`(namespace, entity_type)` hash keyed by job id every time the
//! owner calls [`SearchIndex::index`]; queries scan that hash and filter in
//! process rather than pushing predicates into the backend, which keeps the
//! trait backend-agnostic at the cost of O(n) scans — acceptable here since
//! a production deployment is expected to shard this by entity type and
//! keep each hash small.

use std::sync::Arc;

use serde_json::Value;

use crate::error::MemFlowError;
use crate::store::{Store, StoreKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOp {
    Eq,
    Gt,
    Lt,
    Gte,
    Lte,
    Like,
    In,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub key: String,
    pub context: Value,
}

pub struct SearchIndex<S: Store> {
    store: Arc<S>,
}

impl<S: Store> SearchIndex<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    fn index_key(namespace: &str, entity_type: &str) -> StoreKey {
        StoreKey::new(namespace, entity_type, "_search", "members")
    }

    fn hints_key(namespace: &str, entity_type: &str) -> StoreKey {
        StoreKey::new(namespace, entity_type, "_search", "hints")
    }

    /// Record/replace the indexed-field snapshot for `job_id`. Call this
    /// whenever the owning entity changes; the snapshot is a deep clone, not
    /// an alias, of whatever `Value` is passed — mutating it afterward never
    /// affects the stored index or the live entity (see DESIGN.md's
    /// `getIndexedHash` open-question decision).
    pub async fn index(
        &self,
        namespace: &str,
        entity_type: &str,
        job_id: &str,
        snapshot: Value,
    ) -> Result<(), MemFlowError> {
        let key = Self::index_key(namespace, entity_type);
        let txn = crate::store::Transaction::new().hset(key, job_id, snapshot);
        self.store.commit(txn).await
    }

    /// Provider-hinted index creation: records that `field` should be
    /// indexed for `entity_type`. The in-memory/Postgres-scan backends
    /// don't need a real secondary index to answer queries correctly, but
    /// the hint is persisted so a provider that does maintain one (e.g. a
    /// GIN index on an array field) knows to build it.
    pub async fn create_index(&self, namespace: &str, entity_type: &str, field: &str) -> Result<(), MemFlowError> {
        let key = Self::hints_key(namespace, entity_type);
        let txn = crate::store::Transaction::new().hset(key, field, Value::Bool(true));
        self.store.commit(txn).await
    }

    async fn members(&self, namespace: &str, entity_type: &str) -> Result<Vec<(String, Value)>, MemFlowError> {
        let key = Self::index_key(namespace, entity_type);
        let all = self.store.hgetall(&key).await?;
        Ok(all.into_iter().collect())
    }

    /// Equality conjunction over `conditions`.
    pub async fn find(
        &self,
        namespace: &str,
        entity_type: &str,
        conditions: &[(String, Value)],
    ) -> Result<Vec<SearchHit>, MemFlowError> {
        let members = self.members(namespace, entity_type).await?;
        Ok(members
            .into_iter()
            .filter(|(_, snapshot)| {
                conditions
                    .iter()
                    .all(|(field, expected)| field_eq(snapshot, field, expected))
            })
            .map(|(key, context)| SearchHit { key, context })
            .collect())
    }

    pub async fn find_by_id(
        &self,
        namespace: &str,
        entity_type: &str,
        job_id: &str,
    ) -> Result<Option<SearchHit>, MemFlowError> {
        let key = Self::index_key(namespace, entity_type);
        Ok(self
            .store
            .hget(&key, job_id)
            .await?
            .map(|context| SearchHit {
                key: job_id.to_string(),
                context,
            }))
    }

    pub async fn find_by_condition(
        &self,
        namespace: &str,
        entity_type: &str,
        field: &str,
        value: &Value,
        op: ConditionOp,
    ) -> Result<Vec<SearchHit>, MemFlowError> {
        let members = self.members(namespace, entity_type).await?;
        Ok(members
            .into_iter()
            .filter(|(_, snapshot)| field_matches(snapshot, field, value, op))
            .map(|(key, context)| SearchHit { key, context })
            .collect())
    }
}

fn field_eq(snapshot: &Value, field: &str, expected: &Value) -> bool {
    crate::entity::get_path(snapshot, field) == Some(expected)
}

fn field_matches(snapshot: &Value, field: &str, rhs: &Value, op: ConditionOp) -> bool {
    let Some(lhs) = crate::entity::get_path(snapshot, field) else {
        return false;
    };
    match op {
        ConditionOp::Eq => lhs == rhs,
        ConditionOp::Gt | ConditionOp::Lt | ConditionOp::Gte | ConditionOp::Lte => {
            match (lhs.as_f64(), rhs.as_f64()) {
                (Some(l), Some(r)) => match op {
                    ConditionOp::Gt => l > r,
                    ConditionOp::Lt => l < r,
                    ConditionOp::Gte => l >= r,
                    ConditionOp::Lte => l <= r,
                    _ => unreachable!(),
                },
                _ => false,
            }
        }
        ConditionOp::Like => match (lhs.as_str(), rhs.as_str()) {
            (Some(l), Some(pattern)) => like_matches(l, pattern),
            _ => false,
        },
        ConditionOp::In => match rhs.as_array() {
            Some(values) => values.iter().any(|v| v == lhs),
            None => false,
        },
    }
}

/// SQL-`LIKE`-style matching: `%` as a multi-character wildcard, `_` as a
/// single-character wildcard, no escaping.
fn like_matches(haystack: &str, pattern: &str) -> bool {
    fn go(h: &[u8], p: &[u8]) -> bool {
        match p.first() {
            None => h.is_empty(),
            Some(b'%') => go(h, &p[1..]) || (!h.is_empty() && go(&h[1..], p)),
            Some(b'_') => !h.is_empty() && go(&h[1..], &p[1..]),
            Some(c) => h.first() == Some(c) && go(&h[1..], &p[1..]),
        }
    }
    go(haystack.as_bytes(), pattern.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn find_by_equality_conjunction() {
        let store = Arc::new(InMemoryStore::new());
        let idx = SearchIndex::new(store);
        idx.index("ns", "order", "job-1", json!({"status": "open", "total": 10}))
            .await
            .unwrap();
        idx.index("ns", "order", "job-2", json!({"status": "closed", "total": 10}))
            .await
            .unwrap();

        let hits = idx
            .find("ns", "order", &[("status".to_string(), json!("open"))])
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "job-1");
    }

    #[tokio::test]
    async fn find_by_id_returns_snapshot() {
        let store = Arc::new(InMemoryStore::new());
        let idx = SearchIndex::new(store);
        idx.index("ns", "order", "job-1", json!({"total": 42})).await.unwrap();
        let hit = idx.find_by_id("ns", "order", "job-1").await.unwrap().unwrap();
        assert_eq!(hit.context, json!({"total": 42}));
        assert!(idx.find_by_id("ns", "order", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_by_condition_supports_range_like_and_in() {
        let store = Arc::new(InMemoryStore::new());
        let idx = SearchIndex::new(store);
        idx.index("ns", "order", "job-1", json!({"total": 10, "name": "widget-a"}))
            .await
            .unwrap();
        idx.index("ns", "order", "job-2", json!({"total": 30, "name": "gadget-b"}))
            .await
            .unwrap();

        let over_20 = idx
            .find_by_condition("ns", "order", "total", &json!(20), ConditionOp::Gt)
            .await
            .unwrap();
        assert_eq!(over_20.len(), 1);
        assert_eq!(over_20[0].key, "job-2");

        let like_widget = idx
            .find_by_condition("ns", "order", "name", &json!("widget-%"), ConditionOp::Like)
            .await
            .unwrap();
        assert_eq!(like_widget.len(), 1);
        assert_eq!(like_widget[0].key, "job-1");

        let in_set = idx
            .find_by_condition("ns", "order", "total", &json!([10, 99]), ConditionOp::In)
            .await
            .unwrap();
        assert_eq!(in_set.len(), 1);
        assert_eq!(in_set[0].key, "job-1");
    }

    #[tokio::test]
    async fn snapshot_is_a_clone_not_an_alias() {
        let store = Arc::new(InMemoryStore::new());
        let idx = SearchIndex::new(store);
        let mut live = json!({"total": 1});
        idx.index("ns", "order", "job-1", live.clone()).await.unwrap();
        live["total"] = json!(999);

        let hit = idx.find_by_id("ns", "order", "job-1").await.unwrap().unwrap();
        assert_eq!(hit.context, json!({"total": 1}));
    }
}
