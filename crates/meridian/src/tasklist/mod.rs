//! Persistence view of one task list.
//!
//! All conditional writes for a list are serialized through the owner's
//! mutex. That avoids storage-engine livelock under concurrent lightweight
//! transactions and guarantees exactly one writer at a time; reads stay
//! lock-free. Task ids are allocated in blocks keyed off the lease's range
//! id, so serial owner writes produce contiguous ids and a stale owner can
//! never collide with its successor.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use meridian_persistence::{
    PersistenceError, PersistenceResult, TaskInfo, TaskListInfo, TaskListKey, TaskListKind,
    TaskListPartitionConfig, TaskStore,
};
use tracing::error;
use uuid::Uuid;

/// Task ids per lease block. A renewed lease starts allocating at
/// `range_id * TASK_ID_BLOCK`.
const TASK_ID_BLOCK: i64 = 100_000;

/// Owner view of the lease after a successful renew.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskListLease {
    pub range_id: i64,
    pub ack_level: i64,
}

/// A task to append; ids are assigned under the lease.
#[derive(Clone, Debug)]
pub struct NewTask {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub schedule_id: i64,
    pub expiry: Option<DateTime<Utc>>,
}

struct OwnerState {
    range_id: i64,
    ack_level: i64,
    next_task_id: i64,
    partition_config: Option<TaskListPartitionConfig>,
}

pub struct TaskListDb {
    key: TaskListKey,
    kind: TaskListKind,
    store: Box<dyn TaskStore>,
    state: tokio::sync::Mutex<OwnerState>,
    backlog_count: AtomicI64,
}

impl TaskListDb {
    pub fn new(key: TaskListKey, kind: TaskListKind, store: Box<dyn TaskStore>) -> Self {
        Self {
            key,
            kind,
            store,
            state: tokio::sync::Mutex::new(OwnerState {
                range_id: 0,
                ack_level: 0,
                next_task_id: 0,
                partition_config: None,
            }),
            backlog_count: AtomicI64::new(0),
        }
    }

    pub fn key(&self) -> &TaskListKey {
        &self.key
    }

    /// Current cached backlog size, refreshed by [`Self::get_task_list_size`].
    pub fn backlog_count(&self) -> i64 {
        self.backlog_count.load(Ordering::Relaxed)
    }

    pub async fn range_id(&self) -> i64 {
        self.state.lock().await.range_id
    }

    pub async fn partition_config(&self) -> Option<TaskListPartitionConfig> {
        self.state.lock().await.partition_config.clone()
    }

    /// Renew (or steal) the lease on this list. On success the caller owns
    /// the list and its ack level.
    pub async fn renew_lease(&self) -> PersistenceResult<TaskListLease> {
        let mut state = self.state.lock().await;
        let info = self
            .store
            .lease_task_list(&self.key, self.kind, state.range_id)
            .await?;
        state.range_id = info.range_id;
        state.ack_level = info.ack_level;
        state.partition_config = info.partition_config.clone();
        state.next_task_id = info.range_id * TASK_ID_BLOCK;
        Ok(TaskListLease {
            range_id: info.range_id,
            ack_level: info.ack_level,
        })
    }

    /// Owner-only ack-level update, fenced on the leased range id.
    pub async fn update_state(&self, ack_level: i64) -> PersistenceResult<()> {
        let mut state = self.state.lock().await;
        self.store
            .update_task_list(self.info_locked(&state, ack_level, state.partition_config.clone()))
            .await?;
        state.ack_level = ack_level;
        Ok(())
    }

    /// Owner-only partition config update, fenced on the leased range id.
    pub async fn update_partition_config(
        &self,
        partition_config: TaskListPartitionConfig,
    ) -> PersistenceResult<()> {
        let mut state = self.state.lock().await;
        self.store
            .update_task_list(self.info_locked(
                &state,
                state.ack_level,
                Some(partition_config.clone()),
            ))
            .await?;
        state.partition_config = Some(partition_config);
        Ok(())
    }

    /// Append a batch under the lease. All-or-nothing; returns the assigned
    /// contiguous task ids.
    pub async fn create_tasks(&self, tasks: Vec<NewTask>) -> PersistenceResult<Vec<i64>> {
        let mut state = self.state.lock().await;
        let info = self.info_locked(&state, state.ack_level, state.partition_config.clone());
        let now = Utc::now();
        let mut assigned = Vec::with_capacity(tasks.len());
        let rows: Vec<TaskInfo> = tasks
            .into_iter()
            .map(|task| {
                let task_id = state.next_task_id;
                state.next_task_id += 1;
                assigned.push(task_id);
                TaskInfo {
                    task_id,
                    domain_id: task.domain_id,
                    workflow_id: task.workflow_id,
                    run_id: task.run_id,
                    schedule_id: task.schedule_id,
                    created_time: now,
                    expiry: task.expiry,
                }
            })
            .collect();
        self.store.create_tasks(&info, rows).await?;
        Ok(assigned)
    }

    /// Bounded read over `(min_exclusive, max_inclusive]`. Safe for
    /// non-owners; deliberately not serialized through the owner mutex.
    pub async fn get_tasks(
        &self,
        min_exclusive: i64,
        max_inclusive: i64,
        batch_size: usize,
    ) -> PersistenceResult<Vec<TaskInfo>> {
        self.store
            .get_tasks(&self.key, min_exclusive, max_inclusive, batch_size)
            .await
    }

    /// Best-effort delete of tasks below `task_id`. Deleting fewer than
    /// `limit` rows is not an error.
    pub async fn complete_tasks_less_than(
        &self,
        task_id: i64,
        limit: usize,
    ) -> PersistenceResult<usize> {
        match self
            .store
            .complete_tasks_less_than(&self.key, task_id, limit)
            .await
        {
            Ok(deleted) => Ok(deleted),
            Err(err) => {
                error!(
                    task_list = %self.key.name,
                    task_id,
                    error = %err,
                    "task completion failed"
                );
                Err(err)
            }
        }
    }

    /// Backlog size above `ack_level`; caches the result.
    pub async fn get_task_list_size(&self, ack_level: i64) -> PersistenceResult<i64> {
        let size = self.store.get_task_list_size(&self.key, ack_level).await?;
        self.backlog_count.store(size, Ordering::Relaxed);
        Ok(size)
    }

    fn info_locked(
        &self,
        state: &OwnerState,
        ack_level: i64,
        partition_config: Option<TaskListPartitionConfig>,
    ) -> TaskListInfo {
        TaskListInfo {
            domain_id: self.key.domain_id.clone(),
            name: self.key.name.clone(),
            task_type: self.key.task_type,
            kind: self.kind,
            range_id: state.range_id,
            ack_level,
            partition_config,
        }
    }
}

/// Stale writers surface as condition failures; ownership itself is decided
/// by the stored range id.
pub fn is_lease_lost(err: &PersistenceError) -> bool {
    matches!(err, PersistenceError::ConditionFailed(_))
}

#[cfg(test)]
mod tests {
    use meridian_backend_memory::MemoryBackend;
    use meridian_persistence::TaskListType;

    use super::*;

    fn db(backend: &MemoryBackend) -> TaskListDb {
        TaskListDb::new(
            TaskListKey {
                domain_id: "domain-1".to_string(),
                name: "orders".to_string(),
                task_type: TaskListType::Activity,
            },
            TaskListKind::Normal,
            Box::new(backend.clone()),
        )
    }

    fn new_task(schedule_id: i64) -> NewTask {
        NewTask {
            domain_id: "domain-1".to_string(),
            workflow_id: "wf-1".to_string(),
            run_id: Uuid::new_v4(),
            schedule_id,
            expiry: None,
        }
    }

    #[tokio::test]
    async fn owner_writes_produce_contiguous_ids() {
        let backend = MemoryBackend::new();
        let db = db(&backend);
        let lease = db.renew_lease().await.unwrap();
        assert_eq!(lease.range_id, 1);

        let first = db.create_tasks(vec![new_task(1), new_task(2)]).await.unwrap();
        let second = db.create_tasks(vec![new_task(3)]).await.unwrap();
        assert_eq!(first, vec![TASK_ID_BLOCK, TASK_ID_BLOCK + 1]);
        assert_eq!(second, vec![TASK_ID_BLOCK + 2]);

        let read = db.get_tasks(0, i64::MAX, 100).await.unwrap();
        let ids: Vec<i64> = read.iter().map(|task| task.task_id).collect();
        assert_eq!(ids, vec![TASK_ID_BLOCK, TASK_ID_BLOCK + 1, TASK_ID_BLOCK + 2]);
    }

    #[tokio::test]
    async fn non_owner_create_always_fails() {
        let backend = MemoryBackend::new();
        let owner = db(&backend);
        let usurper = db(&backend);
        owner.renew_lease().await.unwrap();
        usurper.renew_lease().await.unwrap();

        let err = owner.create_tasks(vec![new_task(1)]).await.unwrap_err();
        assert!(is_lease_lost(&err));

        // The usurper's writes land; the stale owner must re-lease before
        // writing again.
        usurper.create_tasks(vec![new_task(1)]).await.unwrap();
        let err = owner.update_state(5).await.unwrap_err();
        assert!(is_lease_lost(&err));
    }

    #[tokio::test]
    async fn reads_are_open_to_non_owners() {
        let backend = MemoryBackend::new();
        let owner = db(&backend);
        let reader = db(&backend);
        owner.renew_lease().await.unwrap();
        owner.create_tasks(vec![new_task(1), new_task(2)]).await.unwrap();

        let read = reader.get_tasks(0, i64::MAX, 10).await.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(reader.get_task_list_size(0).await.unwrap(), 2);
        assert_eq!(reader.backlog_count(), 2);
    }

    #[tokio::test]
    async fn completion_is_best_effort_and_bounded() {
        let backend = MemoryBackend::new();
        let db = db(&backend);
        db.renew_lease().await.unwrap();
        db.create_tasks(vec![new_task(1), new_task(2), new_task(3)])
            .await
            .unwrap();

        let deleted = db
            .complete_tasks_less_than(TASK_ID_BLOCK + 2, 1)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        let remaining = db.get_tasks(0, i64::MAX, 10).await.unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn renewed_lease_restarts_id_block() {
        let backend = MemoryBackend::new();
        let db = db(&backend);
        db.renew_lease().await.unwrap();
        let first = db.create_tasks(vec![new_task(1)]).await.unwrap();

        db.renew_lease().await.unwrap();
        let second = db.create_tasks(vec![new_task(2)]).await.unwrap();
        assert!(second[0] >= first[0] + TASK_ID_BLOCK);
    }
}
