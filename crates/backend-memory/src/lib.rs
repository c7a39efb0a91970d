//! In-memory implementation of the meridian persistence contract.
//!
//! Backs engine tests and the single-cluster degenerate deployment. All
//! conditional-write semantics (range-id fencing, current-run pointer
//! conditions, task-list leases) match what a production driver must
//! provide, so engine tests against this backend exercise the real
//! contracts.

mod execution_store;
mod history_store;
mod shard_store;
mod task_store;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use meridian_persistence::{
    CrossClusterTask, HistoryBranchRecord, HistoryEvent, ReplicationTask, ShardInfo, TaskInfo,
    TaskListInfo, TaskListKey, TimerTask, TransferTask, WorkflowIdentifier, WorkflowSnapshot,
};
use uuid::Uuid;

/// Current-run pointer for one workflow id.
#[derive(Clone, Debug)]
pub struct CurrentRun {
    pub run_id: Uuid,
    pub last_write_version: i64,
    pub closed: bool,
}

/// Shared in-memory state behind every store trait.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    pub shards: Arc<Mutex<HashMap<i32, ShardInfo>>>,
    pub executions: Arc<Mutex<HashMap<(i32, WorkflowIdentifier), WorkflowSnapshot>>>,
    pub current_runs: Arc<Mutex<HashMap<(i32, String, String), CurrentRun>>>,

    pub transfer_tasks: Arc<Mutex<Vec<TransferTask>>>,
    pub timer_tasks: Arc<Mutex<Vec<TimerTask>>>,
    pub replication_tasks: Arc<Mutex<Vec<ReplicationTask>>>,
    pub cross_cluster_tasks: Arc<Mutex<Vec<CrossClusterTask>>>,

    pub task_lists: Arc<Mutex<HashMap<TaskListKey, TaskListInfo>>>,
    pub tasks: Arc<Mutex<HashMap<TaskListKey, BTreeMap<i64, TaskInfo>>>>,

    pub history_branches: Arc<Mutex<BTreeMap<(Uuid, Uuid), HistoryBranchRecord>>>,
    pub history_events: Arc<Mutex<HashMap<Vec<u8>, Vec<HistoryEvent>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test fixture: install a branch row with an explicit fork time.
    pub fn insert_history_branch(
        &self,
        tree_id: Uuid,
        branch_id: Uuid,
        fork_time: DateTime<Utc>,
        info: String,
    ) {
        let mut branches = self.history_branches.lock().expect("branches poisoned");
        branches.insert(
            (tree_id, branch_id),
            HistoryBranchRecord {
                tree_id,
                branch_id,
                fork_time,
                info,
            },
        );
    }

    /// Test fixture: install a workflow snapshot directly.
    pub fn insert_execution(&self, shard_id: i32, snapshot: WorkflowSnapshot) {
        let identifier = snapshot.execution_info.identifier();
        let mut executions = self.executions.lock().expect("executions poisoned");
        executions.insert((shard_id, identifier), snapshot);
    }

    /// Test fixture: point the current-run entry at the given run.
    pub fn set_current_run(
        &self,
        shard_id: i32,
        domain_id: &str,
        workflow_id: &str,
        current: CurrentRun,
    ) {
        let mut current_runs = self.current_runs.lock().expect("current runs poisoned");
        current_runs.insert(
            (shard_id, domain_id.to_string(), workflow_id.to_string()),
            current,
        );
    }
}
