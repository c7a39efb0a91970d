//! Per-shard context: the single writer for everything the shard owns.
//!
//! Acquisition bumps the shard record's range id with a conditional write;
//! every subsequent store write carries that range id. A mismatch anywhere
//! means another host took the lease, and this context poisons itself so no
//! further writes are attempted.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;
use meridian_persistence::{
    CreateWorkflowMode, CreateWorkflowRequest, ExecutionStore, HistoryEvent, HistoryStore,
    PersistenceError, ReplicationTask, ShardInfo, ShardStore, TimerTask, TransferTask,
    UpdateWorkflowMode, UpdateWorkflowRequest, WorkflowIdentifier, WorkflowMutation,
    WorkflowSnapshot,
};
use tracing::{info, warn};

use crate::cluster::ClusterMetadata;
use crate::error::{EngineError, EngineResult};
use crate::shard::EngineRegistry;

/// Task ids are allocated as `range_id << TASK_ID_BITS | sequence`, so a
/// re-acquired shard always allocates above every id from prior owners.
const TASK_ID_BITS: u32 = 24;

/// Bounds for retrying shard acquisition on transient storage failures.
/// A fencing failure is never retried; another host owns the lease.
const ACQUIRE_MAX_RETRIES: usize = 4;
const ACQUIRE_INITIAL_BACKOFF: std::time::Duration = std::time::Duration::from_millis(50);
const ACQUIRE_MAX_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShardStatus {
    Idle,
    Owned,
    Lost,
}

struct ShardState {
    info: ShardInfo,
    status: ShardStatus,
    next_task_sequence: i64,
}

pub struct ShardContext {
    shard_id: i32,
    shard_store: Box<dyn ShardStore>,
    execution_store: Box<dyn ExecutionStore>,
    history_store: Box<dyn HistoryStore>,
    cluster: Arc<ClusterMetadata>,
    registry: Arc<EngineRegistry>,
    state: Mutex<ShardState>,
    /// Serializes conditional writes of the shard record itself.
    record_write_lock: tokio::sync::Mutex<()>,
}

impl ShardContext {
    pub fn new(
        shard_id: i32,
        shard_store: Box<dyn ShardStore>,
        execution_store: Box<dyn ExecutionStore>,
        history_store: Box<dyn HistoryStore>,
        cluster: Arc<ClusterMetadata>,
        registry: Arc<EngineRegistry>,
    ) -> Self {
        Self {
            shard_id,
            shard_store,
            execution_store,
            history_store,
            cluster,
            registry,
            state: Mutex::new(ShardState {
                info: ShardInfo::new(shard_id),
                status: ShardStatus::Idle,
                next_task_sequence: 0,
            }),
            record_write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    pub fn cluster(&self) -> &ClusterMetadata {
        &self.cluster
    }

    /// Take (or retake) the shard lease: read the record, bump the range id,
    /// write back conditioned on the old value. Transient storage failures
    /// are retried with exponential backoff; a range-id mismatch surfaces
    /// immediately.
    pub async fn acquire(&self, owner: &str) -> EngineResult<()> {
        let mut backoff = ACQUIRE_INITIAL_BACKOFF;
        let mut attempt = 0;
        loop {
            match self.try_acquire(owner).await {
                Err(EngineError::Persistence(err))
                    if err.is_retriable() && attempt < ACQUIRE_MAX_RETRIES =>
                {
                    attempt += 1;
                    warn!(
                        shard_id = self.shard_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "shard acquisition failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(ACQUIRE_MAX_BACKOFF);
                }
                other => return other,
            }
        }
    }

    async fn try_acquire(&self, owner: &str) -> EngineResult<()> {
        let _write_guard = self.record_write_lock.lock().await;
        let mut info = match self.shard_store.get_shard(self.shard_id).await {
            Ok(info) => info,
            Err(err) if err.is_not_found() => {
                self.shard_store
                    .create_shard(ShardInfo::new(self.shard_id))
                    .await?;
                self.shard_store.get_shard(self.shard_id).await?
            }
            Err(err) => return Err(err.into()),
        };
        let previous_range_id = info.range_id;
        info.range_id += 1;
        info.owner = owner.to_string();
        info.updated_at = Utc::now();
        self.shard_store
            .update_shard(info.clone(), previous_range_id)
            .await?;

        info!(
            shard_id = self.shard_id,
            range_id = info.range_id,
            owner,
            "acquired shard lease"
        );
        let mut state = self.state.lock().expect("shard state poisoned");
        state.info = info;
        state.status = ShardStatus::Owned;
        state.next_task_sequence = 0;
        Ok(())
    }

    pub fn is_owned(&self) -> bool {
        let state = self.state.lock().expect("shard state poisoned");
        state.status == ShardStatus::Owned
    }

    /// The leased range id, or `ShardOwnershipLost` when the lease is gone.
    pub fn range_id(&self) -> EngineResult<i64> {
        let state = self.state.lock().expect("shard state poisoned");
        if state.status != ShardStatus::Owned {
            return Err(self.ownership_lost("shard lease not held"));
        }
        Ok(state.info.range_id)
    }

    /// Allocate `count` monotonically increasing task ids under the lease.
    pub fn allocate_task_ids(&self, count: usize) -> EngineResult<Vec<i64>> {
        let mut state = self.state.lock().expect("shard state poisoned");
        if state.status != ShardStatus::Owned {
            return Err(self.ownership_lost("shard lease not held"));
        }
        let base = state.info.range_id << TASK_ID_BITS;
        let ids = (0..count as i64)
            .map(|offset| base + state.next_task_sequence + offset)
            .collect();
        state.next_task_sequence += count as i64;
        Ok(ids)
    }

    fn ownership_lost(&self, message: &str) -> EngineError {
        EngineError::Persistence(PersistenceError::ShardOwnershipLost {
            shard_id: self.shard_id,
            message: message.to_string(),
        })
    }

    /// Poison the context; all in-memory state dependent on the lease must
    /// be dropped by callers observing the error.
    fn mark_lost(&self) {
        let mut state = self.state.lock().expect("shard state poisoned");
        if state.status != ShardStatus::Lost {
            warn!(shard_id = self.shard_id, "shard ownership lost");
            state.status = ShardStatus::Lost;
        }
    }

    fn check_write_result<T>(&self, result: Result<T, PersistenceError>) -> EngineResult<T> {
        match result {
            Err(err @ PersistenceError::ShardOwnershipLost { .. }) => {
                self.mark_lost();
                Err(err.into())
            }
            other => other.map_err(EngineError::from),
        }
    }

    pub async fn create_workflow_execution(
        &self,
        mode: CreateWorkflowMode,
        snapshot: WorkflowSnapshot,
        transfer_tasks: Vec<TransferTask>,
        timer_tasks: Vec<TimerTask>,
        replication_tasks: Vec<ReplicationTask>,
    ) -> EngineResult<()> {
        let range_id = self.range_id()?;
        let result = self
            .execution_store
            .create_workflow_execution(CreateWorkflowRequest {
                shard_id: self.shard_id,
                range_id,
                mode,
                snapshot,
                transfer_tasks: transfer_tasks.clone(),
                timer_tasks: timer_tasks.clone(),
                replication_tasks: replication_tasks.clone(),
            })
            .await;
        self.check_write_result(result)?;
        self.publish_task_notifications(&transfer_tasks, &timer_tasks, &replication_tasks);
        Ok(())
    }

    fn publish_task_notifications(
        &self,
        transfer_tasks: &[TransferTask],
        timer_tasks: &[TimerTask],
        replication_tasks: &[ReplicationTask],
    ) {
        if let Some(engine) = self.registry.get(self.shard_id) {
            if !transfer_tasks.is_empty() {
                engine.notify_new_transfer_tasks(transfer_tasks);
            }
            if !timer_tasks.is_empty() {
                engine.notify_new_timer_tasks(timer_tasks);
            }
            if !replication_tasks.is_empty() {
                engine.notify_new_replication_tasks(replication_tasks);
            }
        }
    }

    pub async fn update_workflow_execution(
        &self,
        mode: UpdateWorkflowMode,
        mutation: WorkflowMutation,
        new_snapshot: Option<WorkflowSnapshot>,
    ) -> EngineResult<()> {
        let range_id = self.range_id()?;
        let transfer_tasks = mutation.transfer_tasks.clone();
        let timer_tasks = mutation.timer_tasks.clone();
        let replication_tasks = mutation.replication_tasks.clone();
        let result = self
            .execution_store
            .update_workflow_execution(UpdateWorkflowRequest {
                shard_id: self.shard_id,
                range_id,
                mode,
                mutation,
                new_snapshot,
            })
            .await;
        self.check_write_result(result)?;
        self.publish_task_notifications(&transfer_tasks, &timer_tasks, &replication_tasks);
        Ok(())
    }

    pub async fn get_workflow_execution(
        &self,
        identifier: &WorkflowIdentifier,
    ) -> EngineResult<WorkflowSnapshot> {
        self.execution_store
            .get_workflow_execution(self.shard_id, identifier)
            .await
            .map_err(EngineError::from)
    }

    pub async fn get_current_run_id(
        &self,
        domain_id: &str,
        workflow_id: &str,
    ) -> EngineResult<Uuid> {
        self.execution_store
            .get_current_run_id(self.shard_id, domain_id, workflow_id)
            .await
            .map_err(EngineError::from)
    }

    pub async fn create_history_branch(
        &self,
        token: &meridian_persistence::HistoryBranchToken,
        info: String,
    ) -> EngineResult<()> {
        self.range_id()?;
        let result = self.history_store.create_history_branch(token, info).await;
        self.check_write_result(result)
    }

    pub async fn fork_history_branch(
        &self,
        source_token: &[u8],
        new_token: &meridian_persistence::HistoryBranchToken,
        fork_event_id: i64,
        info: String,
    ) -> EngineResult<()> {
        self.range_id()?;
        let result = self
            .history_store
            .fork_history_branch(self.shard_id, source_token, new_token, fork_event_id, info)
            .await;
        self.check_write_result(result)
    }

    pub async fn append_history_events(
        &self,
        branch_token: &[u8],
        events: &[HistoryEvent],
    ) -> EngineResult<()> {
        // The fence for history writes is the execution update that follows
        // in the same transaction; an orphaned append is garbage the
        // scavenger reclaims.
        self.range_id()?;
        let result = self
            .history_store
            .append_history_events(self.shard_id, branch_token, events)
            .await;
        self.check_write_result(result)
    }

    pub async fn get_history_events(
        &self,
        branch_token: &[u8],
        min_event_id: i64,
        max_event_id: i64,
    ) -> EngineResult<Vec<HistoryEvent>> {
        self.history_store
            .get_history_events(branch_token, min_event_id, max_event_id)
            .await
            .map_err(EngineError::from)
    }

    pub async fn update_transfer_ack_level(&self, level: i64) -> EngineResult<()> {
        self.update_record(|info| info.transfer_ack_level = level)
            .await
    }

    pub async fn update_timer_ack_level(&self, level: DateTime<Utc>) -> EngineResult<()> {
        self.update_record(|info| info.timer_ack_level = level).await
    }

    pub async fn update_cluster_replication_level(
        &self,
        cluster: &str,
        level: i64,
    ) -> EngineResult<()> {
        let cluster = cluster.to_string();
        self.update_record(move |info| {
            info.cluster_replication_level.insert(cluster, level);
        })
        .await
    }

    /// Serve a peer cluster's poll of this shard's replication queue. The
    /// acknowledged position is persisted under the fence before the next
    /// batch is read.
    pub async fn get_replication_messages(
        &self,
        polling_cluster: &str,
        last_read_message_id: i64,
        batch_size: usize,
    ) -> EngineResult<Vec<ReplicationTask>> {
        let acked = {
            let state = self.state.lock().expect("shard state poisoned");
            state
                .info
                .cluster_replication_level
                .get(polling_cluster)
                .copied()
                .unwrap_or(0)
        };
        if last_read_message_id > acked {
            self.update_cluster_replication_level(polling_cluster, last_read_message_id)
                .await?;
        }
        self.execution_store
            .get_replication_tasks(self.shard_id, last_read_message_id, batch_size)
            .await
            .map_err(EngineError::from)
    }

    /// Record a peer cluster's shard progress timestamp.
    pub async fn sync_shard_status(
        &self,
        source_cluster: &str,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<()> {
        let source_cluster = source_cluster.to_string();
        self.update_record(move |info| {
            info.cluster_timer_ack_level.insert(source_cluster, timestamp);
        })
        .await
    }

    pub fn shard_info(&self) -> ShardInfo {
        let state = self.state.lock().expect("shard state poisoned");
        state.info.clone()
    }

    async fn update_record(
        &self,
        mutate: impl FnOnce(&mut ShardInfo),
    ) -> EngineResult<()> {
        let _write_guard = self.record_write_lock.lock().await;
        let (mut info, expected_range_id) = {
            let state = self.state.lock().expect("shard state poisoned");
            if state.status != ShardStatus::Owned {
                return Err(self.ownership_lost("shard lease not held"));
            }
            (state.info.clone(), state.info.range_id)
        };
        mutate(&mut info);
        info.updated_at = Utc::now();
        let result = self
            .shard_store
            .update_shard(info.clone(), expected_range_id)
            .await;
        self.check_write_result(result)?;
        let mut state = self.state.lock().expect("shard state poisoned");
        state.info = info;
        Ok(())
    }
}
