//! Persistence contract for the meridian history service.
//!
//! The engine only ever sees these traits. Conditional writes are keyed on
//! the shard `range_id` (shards, executions) or the task-list `range_id`
//! (task lists); a mismatch means the caller lost its lease and must stop.

mod data;
mod error;

use uuid::Uuid;

pub use self::data::*;
pub use self::error::{PersistenceError, PersistenceResult};

/// CRUD for shard ownership records.
#[async_trait::async_trait]
pub trait ShardStore: Send + Sync {
    fn clone_box(&self) -> Box<dyn ShardStore>;

    /// Insert the bootstrap record for a shard; no-op if it already exists.
    async fn create_shard(&self, info: ShardInfo) -> PersistenceResult<()>;

    async fn get_shard(&self, shard_id: i32) -> PersistenceResult<ShardInfo>;

    /// Conditional write: succeeds only when the stored range id equals
    /// `expected_range_id`.
    async fn update_shard(
        &self,
        info: ShardInfo,
        expected_range_id: i64,
    ) -> PersistenceResult<()>;
}

impl Clone for Box<dyn ShardStore> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// CRUD for workflow executions and their task queues.
#[async_trait::async_trait]
pub trait ExecutionStore: Send + Sync {
    fn clone_box(&self) -> Box<dyn ExecutionStore>;

    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowRequest,
    ) -> PersistenceResult<()>;

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowRequest,
    ) -> PersistenceResult<()>;

    async fn get_workflow_execution(
        &self,
        shard_id: i32,
        identifier: &WorkflowIdentifier,
    ) -> PersistenceResult<WorkflowSnapshot>;

    /// Read outbound replication tasks above `min_task_id_exclusive`, in
    /// task-id order.
    async fn get_replication_tasks(
        &self,
        shard_id: i32,
        min_task_id_exclusive: i64,
        batch_size: usize,
    ) -> PersistenceResult<Vec<ReplicationTask>>;

    /// Resolve the current run for a workflow id.
    async fn get_current_run_id(
        &self,
        shard_id: i32,
        domain_id: &str,
        workflow_id: &str,
    ) -> PersistenceResult<Uuid>;

    async fn delete_workflow_execution(
        &self,
        shard_id: i32,
        identifier: &WorkflowIdentifier,
    ) -> PersistenceResult<()>;
}

impl Clone for Box<dyn ExecutionStore> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Leased, range-id-fenced append-only queue per task list.
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    fn clone_box(&self) -> Box<dyn TaskStore>;

    /// Compare-and-swap on the stored range id; on success the caller owns
    /// the list. Steals the list when `expected_range_id` matches storage.
    async fn lease_task_list(
        &self,
        key: &TaskListKey,
        kind: TaskListKind,
        expected_range_id: i64,
    ) -> PersistenceResult<TaskListInfo>;

    /// Owner-only metadata write, conditional on `info.range_id`.
    async fn update_task_list(&self, info: TaskListInfo) -> PersistenceResult<()>;

    /// Append a batch; all-or-nothing, fenced on `info.range_id`.
    async fn create_tasks(
        &self,
        info: &TaskListInfo,
        tasks: Vec<TaskInfo>,
    ) -> PersistenceResult<()>;

    /// Bounded read over `(min_exclusive, max_inclusive]`; safe for
    /// non-owners.
    async fn get_tasks(
        &self,
        key: &TaskListKey,
        min_exclusive: i64,
        max_inclusive: i64,
        batch_size: usize,
    ) -> PersistenceResult<Vec<TaskInfo>>;

    /// Best-effort delete of tasks with id less than `task_id`; may honor
    /// `limit` only partially. Returns the number deleted.
    async fn complete_tasks_less_than(
        &self,
        key: &TaskListKey,
        task_id: i64,
        limit: usize,
    ) -> PersistenceResult<usize>;

    async fn get_task_list_size(
        &self,
        key: &TaskListKey,
        ack_level: i64,
    ) -> PersistenceResult<i64>;
}

impl Clone for Box<dyn TaskStore> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Append-only event storage plus the history-tree index.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    fn clone_box(&self) -> Box<dyn HistoryStore>;

    async fn append_history_events(
        &self,
        shard_id: i32,
        branch_token: &[u8],
        events: &[HistoryEvent],
    ) -> PersistenceResult<()>;

    async fn get_history_events(
        &self,
        branch_token: &[u8],
        min_event_id: i64,
        max_event_id: i64,
    ) -> PersistenceResult<Vec<HistoryEvent>>;

    /// Register a branch row in the history tree. `info` carries the
    /// encoded cleanup coordinates.
    async fn create_history_branch(
        &self,
        token: &HistoryBranchToken,
        info: String,
    ) -> PersistenceResult<()>;

    /// Copy a branch's events up to and including `fork_event_id` under a
    /// new branch token, registering the new branch row.
    async fn fork_history_branch(
        &self,
        shard_id: i32,
        source_token: &[u8],
        new_token: &HistoryBranchToken,
        fork_event_id: i64,
        info: String,
    ) -> PersistenceResult<()>;

    /// Paged scan over every branch of every tree.
    async fn get_all_history_tree_branches(
        &self,
        page_size: usize,
        next_page_token: Option<Vec<u8>>,
    ) -> PersistenceResult<HistoryBranchPage>;

    async fn delete_history_branch(
        &self,
        shard_id: i32,
        branch_token: &[u8],
    ) -> PersistenceResult<()>;
}

impl Clone for Box<dyn HistoryStore> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}
