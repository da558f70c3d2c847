//! The Entity: a single mutable JSON document scoped to one job, persisted
//! under the job's `udata` attribute, shared between a workflow's main body
//! and its hooks.
//!
//! Grounded on `persistence.rs`'s load-before-decide/save-before-dispatch
//! contract: every mutation here is the same read-current-revision,
//! transform, `set_if(expected)`-or-retry loop `PersistentMachine` uses for
//! typed snapshots, applied instead to a `serde_json::Value` tree so dotted
//! paths can be set/merged/incremented independently of the document's
//! overall shape.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::MemFlowError;
use crate::store::{Store, StoreKey};

/// Shared per-job JSON document. Cheap to clone — it only holds the key and
/// a handle to the backing `Store`.
#[derive(Clone)]
pub struct Entity<S: Store> {
    store: Arc<S>,
    key: StoreKey,
}

impl<S: Store> Entity<S> {
    pub fn new(store: Arc<S>, namespace: &str, app_id: &str, job_id: &str) -> Self {
        Self {
            store,
            key: StoreKey::new(namespace, app_id, job_id, "udata"),
        }
    }

    pub async fn get(&self) -> Result<Value, MemFlowError> {
        Ok(self
            .store
            .get(&self.key)
            .await?
            .unwrap_or(Value::Object(Map::new())))
    }

    /// Replace the whole document.
    pub async fn set(&self, document: Value) -> Result<(), MemFlowError> {
        self.mutate(|_current| Ok(document.clone())).await.map(|_| ())
    }

    /// Deep-merge `partial` into the document: object keys recurse, arrays
    /// and scalars overwrite at their leaf path.
    pub async fn merge(&self, partial: Value) -> Result<Value, MemFlowError> {
        self.mutate(|mut current| {
            deep_merge(&mut current, partial.clone());
            Ok(current)
        })
        .await
    }

    /// Append `item` to the array at `path`, creating an empty array there
    /// if the path is absent.
    pub async fn append(&self, path: &str, item: Value) -> Result<Value, MemFlowError> {
        self.mutate_array(path, move |arr| arr.push(item.clone()))
            .await
    }

    /// Prepend `item` to the array at `path`, creating an empty array there
    /// if the path is absent.
    pub async fn prepend(&self, path: &str, item: Value) -> Result<Value, MemFlowError> {
        self.mutate_array(path, move |arr| arr.insert(0, item.clone()))
            .await
    }

    /// Add `n` to the number at `path` (default `1`), initializing it to 0
    /// if absent. Fails if the existing value is neither numeric nor
    /// missing.
    pub async fn increment(&self, path: &str, n: i64) -> Result<Value, MemFlowError> {
        self.mutate(|mut current| {
            let existing = get_path(&current, path).cloned().unwrap_or(Value::from(0));
            let base = existing.as_i64().ok_or_else(|| {
                MemFlowError::Backend(anyhow::anyhow!(
                    "increment: value at {path} is not numeric"
                ))
            })?;
            set_path(&mut current, path, Value::from(base + n));
            Ok(current)
        })
        .await
    }

    /// Flip the boolean at `path`. Fails if the existing value is not a
    /// boolean (absent defaults to `false`, so the first toggle sets it to
    /// `true`).
    pub async fn toggle(&self, path: &str) -> Result<Value, MemFlowError> {
        self.mutate(|mut current| {
            let existing = get_path(&current, path).cloned().unwrap_or(Value::Bool(false));
            let flipped = existing.as_bool().ok_or_else(|| {
                MemFlowError::Backend(anyhow::anyhow!("toggle: value at {path} is not boolean"))
            })?;
            set_path(&mut current, path, Value::Bool(!flipped));
            Ok(current)
        })
        .await
    }

    /// Set `value` at `path` only if nothing is currently there. A no-op
    /// (returns the unchanged document) when the path already resolves.
    pub async fn set_if_not_exists(&self, path: &str, value: Value) -> Result<Value, MemFlowError> {
        self.mutate(|mut current| {
            if get_path(&current, path).is_none() {
                set_path(&mut current, path, value.clone());
            }
            Ok(current)
        })
        .await
    }

    /// Read-modify-write against the current revision, retrying on
    /// `StoreConflict` until the CAS succeeds — the same shape as
    /// `PersistentMachine::step`, generalized to a JSON value instead of a
    /// typed snapshot.
    async fn mutate(
        &self,
        f: impl Fn(Value) -> Result<Value, MemFlowError>,
    ) -> Result<Value, MemFlowError> {
        loop {
            let (current, revision) = self.store.get_with_revision(&self.key).await?;
            let current = current.unwrap_or(Value::Object(Map::new()));
            let next = f(current)?;
            match self.store.set_if(&self.key, next.clone(), revision).await {
                Ok(_) => return Ok(next),
                Err(MemFlowError::StoreConflict) => continue,
                Err(other) => return Err(other),
            }
        }
    }

    async fn mutate_array(
        &self,
        path: &str,
        edit: impl Fn(&mut Vec<Value>),
    ) -> Result<Value, MemFlowError> {
        self.mutate(|mut current| {
            let existing = get_path(&current, path).cloned().unwrap_or(Value::Array(Vec::new()));
            let mut arr = match existing {
                Value::Array(arr) => arr,
                other => {
                    return Err(MemFlowError::Backend(anyhow::anyhow!(
                        "append/prepend: value at {path} is not an array ({other})"
                    )))
                }
            };
            edit(&mut arr);
            set_path(&mut current, path, Value::Array(arr));
            Ok(current)
        })
        .await
    }
}

/// Deep-merge `b` into `a` in place: object keys recurse, any other pairing
/// (array into array, scalar into anything, object into non-object) simply
/// overwrites `a` with `b`'s value at that leaf.
pub fn deep_merge(a: &mut Value, b: Value) {
    match (a, b) {
        (Value::Object(a_map), Value::Object(b_map)) => {
            for (key, b_val) in b_map {
                match a_map.get_mut(&key) {
                    Some(a_val) => deep_merge(a_val, b_val),
                    None => {
                        a_map.insert(key, b_val);
                    }
                }
            }
        }
        (a_slot, b_val) => *a_slot = b_val,
    }
}

/// Resolve a dotted path (`"a.b.c"`) against a JSON value.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = value;
    for segment in path.split('.') {
        cursor = cursor.as_object()?.get(segment)?;
    }
    Some(cursor)
}

/// Set a dotted path, creating intermediate objects as needed. Overwrites
/// any non-object value found along the way.
pub fn set_path(value: &mut Value, path: &str, new_value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut cursor = value;
    for segment in &segments[..segments.len() - 1] {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let map = cursor.as_object_mut().expect("just ensured object");
        cursor = map.entry(*segment).or_insert(Value::Object(Map::new()));
    }
    if !cursor.is_object() && segments.len() > 1 {
        *cursor = Value::Object(Map::new());
    }
    match segments.last() {
        Some(last) => {
            if !cursor.is_object() {
                *cursor = Value::Object(Map::new());
            }
            cursor
                .as_object_mut()
                .expect("just ensured object")
                .insert((*last).to_string(), new_value);
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn entity() -> Entity<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        Entity::new(store, "ns", "app", "job-1")
    }

    #[tokio::test]
    async fn set_replaces_whole_document() {
        let e = entity();
        e.set(json!({"a": 1})).await.unwrap();
        assert_eq!(e.get().await.unwrap(), json!({"a": 1}));
        e.set(json!({"b": 2})).await.unwrap();
        assert_eq!(e.get().await.unwrap(), json!({"b": 2}));
    }

    #[tokio::test]
    async fn merge_deep_merges_nested_objects_and_overwrites_leaves() {
        let e = entity();
        e.set(json!({"a": {"x": 1, "y": 2}, "list": [1, 2]})).await.unwrap();
        e.merge(json!({"a": {"y": 99, "z": 3}, "list": [9]})).await.unwrap();
        assert_eq!(
            e.get().await.unwrap(),
            json!({"a": {"x": 1, "y": 99, "z": 3}, "list": [9]})
        );
    }

    #[tokio::test]
    async fn append_and_prepend_create_array_when_absent() {
        let e = entity();
        e.append("items", json!("a")).await.unwrap();
        e.append("items", json!("b")).await.unwrap();
        e.prepend("items", json!("z")).await.unwrap();
        assert_eq!(e.get().await.unwrap(), json!({"items": ["z", "a", "b"]}));
    }

    #[tokio::test]
    async fn increment_initializes_at_zero_then_accumulates() {
        let e = entity();
        let after = e.increment("counters.hits", 1).await.unwrap();
        assert_eq!(get_path(&after, "counters.hits"), Some(&json!(1)));
        e.increment("counters.hits", 4).await.unwrap();
        let final_doc = e.get().await.unwrap();
        assert_eq!(get_path(&final_doc, "counters.hits"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn toggle_flips_boolean_defaulting_to_false() {
        let e = entity();
        let after = e.toggle("flags.enabled").await.unwrap();
        assert_eq!(get_path(&after, "flags.enabled"), Some(&json!(true)));
        e.toggle("flags.enabled").await.unwrap();
        let final_doc = e.get().await.unwrap();
        assert_eq!(get_path(&final_doc, "flags.enabled"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn set_if_not_exists_is_a_no_op_when_path_resolves() {
        let e = entity();
        e.set(json!({"a": 1})).await.unwrap();
        e.set_if_not_exists("a", json!(999)).await.unwrap();
        e.set_if_not_exists("b", json!(2)).await.unwrap();
        assert_eq!(e.get().await.unwrap(), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn dotted_path_helpers_create_intermediate_objects() {
        let mut v = json!({});
        set_path(&mut v, "a.b.c", json!(42));
        assert_eq!(get_path(&v, "a.b.c"), Some(&json!(42)));
        assert_eq!(get_path(&v, "a.b.missing"), None);
    }
}
