//! Execution cache: per-run contexts with byte-bounded eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use meridian_persistence::WorkflowIdentifier;
use tracing::debug;

use crate::domain::DomainResolver;
use crate::execution::WorkflowContext;
use crate::shard::ShardContext;

pub struct ExecutionCache {
    shard: Arc<ShardContext>,
    domains: Arc<dyn DomainResolver>,
    max_bytes: usize,
    access_counter: AtomicU64,
    entries: Mutex<HashMap<WorkflowIdentifier, Arc<WorkflowContext>>>,
}

impl ExecutionCache {
    pub fn new(
        shard: Arc<ShardContext>,
        domains: Arc<dyn DomainResolver>,
        max_bytes: usize,
    ) -> Self {
        Self {
            shard,
            domains,
            max_bytes,
            access_counter: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Shared handle for the run's context, creating it on first use.
    pub fn get_or_create(&self, identifier: &WorkflowIdentifier) -> Arc<WorkflowContext> {
        let mut entries = self.entries.lock().expect("execution cache poisoned");
        let context = entries
            .entry(identifier.clone())
            .or_insert_with(|| {
                Arc::new(WorkflowContext::new(
                    identifier.clone(),
                    Arc::clone(&self.shard),
                    Arc::clone(&self.domains),
                ))
            })
            .clone();
        context
            .last_access
            .store(self.access_counter.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        self.evict_over_budget(&mut entries, identifier);
        context
    }

    /// Drop a specific entry (used when an owner loses its shard).
    pub fn remove(&self, identifier: &WorkflowIdentifier) {
        let mut entries = self.entries.lock().expect("execution cache poisoned");
        entries.remove(identifier);
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().expect("execution cache poisoned");
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        let entries = self.entries.lock().expect("execution cache poisoned");
        entries.values().map(|entry| entry.byte_size()).sum()
    }

    /// Evict least-recently-used entries until the byte budget holds.
    /// Locked contexts are pinned (someone is mid read-modify-write), as is
    /// the entry being handed out right now.
    fn evict_over_budget(
        &self,
        entries: &mut HashMap<WorkflowIdentifier, Arc<WorkflowContext>>,
        keep: &WorkflowIdentifier,
    ) {
        let mut total: usize = entries.values().map(|entry| entry.byte_size()).sum();
        if total <= self.max_bytes {
            return;
        }
        let mut candidates: Vec<(u64, WorkflowIdentifier)> = entries
            .iter()
            .filter(|(key, _)| *key != keep)
            .map(|(key, entry)| (entry.last_access.load(Ordering::Relaxed), key.clone()))
            .collect();
        candidates.sort_unstable_by_key(|(access, _)| *access);
        for (_, key) in candidates {
            if total <= self.max_bytes {
                break;
            }
            let Some(entry) = entries.get(&key) else {
                continue;
            };
            if entry.is_locked() {
                continue;
            }
            let size = entry.byte_size();
            entries.remove(&key);
            total = total.saturating_sub(size);
            debug!(identifier = %key, bytes = size, "evicted workflow context");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use meridian_backend_memory::MemoryBackend;
    use meridian_persistence::CreateWorkflowMode;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::cluster::ClusterMetadata;
    use crate::domain::StaticDomainResolver;
    use crate::execution::{MutableState, NewEvent};
    use crate::shard::EngineRegistry;
    use meridian_persistence::EventKind;

    async fn cache(max_bytes: usize) -> ExecutionCache {
        let backend = MemoryBackend::new();
        let shard = Arc::new(ShardContext::new(
            0,
            Box::new(backend.clone()),
            Box::new(backend.clone()),
            Box::new(backend),
            Arc::new(ClusterMetadata::single("east")),
            Arc::new(EngineRegistry::new()),
        ));
        shard.acquire("host-a").await.unwrap();
        ExecutionCache::new(shard, Arc::new(StaticDomainResolver::new()), max_bytes)
    }

    fn identifier(n: u32) -> WorkflowIdentifier {
        WorkflowIdentifier::new("domain-1", format!("wf-{n}"), Uuid::new_v4())
    }

    async fn start_workflow(cache: &ExecutionCache, key: &WorkflowIdentifier) {
        let context = cache.get_or_create(key);
        let cancellation = CancellationToken::new();
        let mut handle = context.lock(&cancellation).await.unwrap();
        let mut state = MutableState::start(
            key.domain_id.clone(),
            key.workflow_id.clone(),
            key.run_id,
            "orders",
            "order-processing",
            std::time::Duration::from_secs(3600),
            std::time::Duration::from_secs(10),
            0,
            false,
            Utc::now(),
        );
        state
            .apply_events(
                vec![NewEvent {
                    kind: EventKind::WorkflowStarted,
                    payload: serde_json::json!({}),
                }],
                Utc::now(),
            )
            .unwrap();
        handle
            .create_workflow(
                state,
                CreateWorkflowMode::UpdateCurrent,
                crate::execution::TransactionPolicy::Active,
                Utc::now(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn same_key_returns_same_context() {
        let cache = cache(1 << 20).await;
        let key = identifier(1);
        let first = cache.get_or_create(&key);
        let second = cache.get_or_create(&key);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn lock_is_exclusive_and_cancellable() {
        let cache = cache(1 << 20).await;
        let key = identifier(1);
        let context = cache.get_or_create(&key);

        let cancellation = CancellationToken::new();
        let held = context.lock(&cancellation).await.unwrap();

        let contender = CancellationToken::new();
        contender.cancel();
        let err = context.lock(&contender).await.unwrap_err();
        assert!(matches!(err, crate::error::EngineError::Cancelled));

        drop(held);
        context.lock(&cancellation).await.unwrap();
    }

    #[tokio::test]
    async fn eviction_frees_unlocked_entries_only() {
        // Budget below one loaded state: every insert forces an eviction
        // pass.
        let cache = cache(64).await;
        let pinned_key = identifier(1);
        let evictable_key = identifier(2);
        start_workflow(&cache, &pinned_key).await;

        let pinned = cache.get_or_create(&pinned_key);
        let cancellation = CancellationToken::new();
        let _held = pinned.lock(&cancellation).await.unwrap();
        assert!(pinned.byte_size() > 64);

        start_workflow(&cache, &evictable_key).await;

        // Touching a third key triggers eviction: the unlocked loaded entry
        // goes, the locked one stays.
        cache.get_or_create(&identifier(3));
        let entries = cache.entries.lock().expect("execution cache poisoned");
        assert!(entries.contains_key(&pinned_key));
        assert!(!entries.contains_key(&evictable_key));
    }
}
