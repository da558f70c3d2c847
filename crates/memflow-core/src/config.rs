//! Typed runtime configuration and the connection-pooling contract.
//!
//! Mirrors `OutboxPublisherConfig`'s builder-with-`Default` shape: a plain
//! struct with sane defaults, overridden field-by-field, never assembled
//! from environment lookups scattered through the codebase.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MemFlowError, RetryPolicy};

/// Backend a provider factory should construct for a given configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendTag {
    InMemory,
    Postgres,
}

/// Top-level runtime configuration for a `taskQueue`. Providers (Store,
/// StreamBus, Journal) are pooled and reused per `(taskQueue, configHash)` —
/// see [`MemFlowConfig::config_hash`] — never sniffed from a connection
/// string at call time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemFlowConfig {
    pub namespace: String,
    pub task_queue: String,
    pub backend: BackendTag,
    pub reservation_timeout: Duration,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub retry_policy: RetryPolicy,
    /// Minimum granularity the Scheduler rounds sleeps/timers to; the
    /// external interface floors this at 5 seconds by default.
    pub timer_fidelity: Duration,
    pub shutdown_grace_period: Duration,
}

impl Default for MemFlowConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            task_queue: "default".to_string(),
            backend: BackendTag::InMemory,
            reservation_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
            retry_policy: RetryPolicy::default(),
            timer_fidelity: Duration::from_secs(5),
            shutdown_grace_period: Duration::from_secs(10),
        }
    }
}

impl MemFlowConfig {
    pub fn new(namespace: impl Into<String>, task_queue: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            task_queue: task_queue.into(),
            ..Self::default()
        }
    }

    pub fn with_backend(mut self, backend: BackendTag) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_reservation_timeout(mut self, timeout: Duration) -> Self {
        self.reservation_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Stable key identifying this configuration for provider pooling.
    /// Deliberately coarse — only the fields that change which physical
    /// connection/pool a provider needs participate in the hash.
    pub fn config_hash(&self) -> String {
        format!(
            "{}:{}:{:?}",
            self.namespace, self.task_queue, self.backend
        )
    }
}

/// Pooled count of providers created/reused for one `task_queue`.
#[derive(Debug, Default, Clone, Copy)]
struct TaskQueueCounts {
    created: usize,
    reused: usize,
}

/// Introspectable snapshot of a [`ProviderRegistry`]'s pooling behavior.
#[derive(Debug, Clone)]
pub struct ProviderRegistryStats {
    pub total_providers: usize,
    pub reuse_count: usize,
    pub per_task_queue: HashMap<String, usize>,
}

/// Keeps at most one provider instance alive per `(taskQueue, configHash)`,
/// so roles sharing a task queue and configuration reuse the same Store,
/// StreamBus, or Journal connection pool instead of each opening its own.
///
/// Grounded on `AuditLog`'s mutex-guarded-state-plus-`stats()` shape
/// ([`crate::audit::AuditLog`]); unlike the audit log this also has to hold
/// the lock across an `await` while a cache miss runs its factory, so the
/// entry table is a `tokio::sync::Mutex` rather than a `std::sync::Mutex`.
pub struct ProviderRegistry<T> {
    entries: tokio::sync::Mutex<HashMap<(String, String), Arc<T>>>,
    counts: Mutex<HashMap<String, TaskQueueCounts>>,
}

impl<T> ProviderRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: tokio::sync::Mutex::new(HashMap::new()),
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Return the pooled provider for `config`'s `(task_queue, config_hash)`,
    /// running `factory` to build one on a cache miss. Concurrent callers
    /// for the same key serialize on the miss rather than racing to build
    /// duplicate providers.
    pub async fn get_or_create<F, Fut, E>(
        &self,
        config: &MemFlowConfig,
        factory: F,
    ) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = (config.task_queue.clone(), config.config_hash());
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(&key) {
            let provider = existing.clone();
            self.record(&config.task_queue, true);
            return Ok(provider);
        }
        let provider = Arc::new(factory().await?);
        entries.insert(key, provider.clone());
        self.record(&config.task_queue, false);
        Ok(provider)
    }

    fn record(&self, task_queue: &str, reused: bool) {
        let mut counts = self.counts.lock().expect("provider registry mutex poisoned");
        let entry = counts.entry(task_queue.to_string()).or_default();
        if reused {
            entry.reused += 1;
        } else {
            entry.created += 1;
        }
    }

    pub fn stats(&self) -> ProviderRegistryStats {
        let counts = self.counts.lock().expect("provider registry mutex poisoned");
        let total_providers = counts.values().map(|c| c.created).sum();
        let reuse_count = counts.values().map(|c| c.reused).sum();
        let per_task_queue = counts
            .iter()
            .map(|(queue, c)| (queue.clone(), c.created + c.reused))
            .collect();
        ProviderRegistryStats {
            total_providers,
            reuse_count,
            per_task_queue,
        }
    }
}

impl<T> Default for ProviderRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_defaults() {
        let config = MemFlowConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.timer_fidelity, Duration::from_secs(5));
    }

    #[test]
    fn config_hash_is_stable_and_distinguishes_task_queues() {
        let a = MemFlowConfig::new("ns", "queue-a");
        let b = MemFlowConfig::new("ns", "queue-b");
        assert_eq!(a.config_hash(), a.config_hash());
        assert_ne!(a.config_hash(), b.config_hash());
    }

    #[tokio::test]
    async fn registry_reuses_provider_for_same_task_queue_and_config_hash() {
        let registry: ProviderRegistry<u32> = ProviderRegistry::new();
        let config = MemFlowConfig::new("ns", "queue-a");

        let first = registry
            .get_or_create(&config, || async { Ok::<_, MemFlowError>(1) })
            .await
            .unwrap();
        let second = registry
            .get_or_create(&config, || async { Ok::<_, MemFlowError>(2) })
            .await
            .unwrap();

        assert_eq!(*first, 1);
        assert_eq!(*second, 1);
        assert!(Arc::ptr_eq(&first, &second));

        let stats = registry.stats();
        assert_eq!(stats.total_providers, 1);
        assert_eq!(stats.reuse_count, 1);
        assert_eq!(stats.per_task_queue.get("queue-a"), Some(&2));
    }

    #[tokio::test]
    async fn registry_keys_providers_by_config_hash_within_a_task_queue() {
        let registry: ProviderRegistry<u32> = ProviderRegistry::new();
        let inmem = MemFlowConfig::new("ns", "queue-a").with_backend(BackendTag::InMemory);
        let postgres = MemFlowConfig::new("ns", "queue-a").with_backend(BackendTag::Postgres);

        let a = registry
            .get_or_create(&inmem, || async { Ok::<_, MemFlowError>(1) })
            .await
            .unwrap();
        let b = registry
            .get_or_create(&postgres, || async { Ok::<_, MemFlowError>(2) })
            .await
            .unwrap();

        assert_eq!(*a, 1);
        assert_eq!(*b, 2);
        assert_eq!(registry.stats().total_providers, 2);
    }
}
