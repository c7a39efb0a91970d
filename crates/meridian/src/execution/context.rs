//! Workflow context: the exclusive read-modify-write handle for one run.
//!
//! The context owns the cached mutable state behind an async mutex. Callers
//! lock, load, mutate, persist, and the guard unlocks on every exit path.
//! Any error that could leave the cache stale clears it; the next reader
//! reloads from persistence.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use meridian_persistence::{CreateWorkflowMode, UpdateWorkflowMode, WorkflowIdentifier};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::DomainResolver;
use crate::error::{EngineError, EngineResult};
use crate::execution::{MutableState, TransactionPolicy};
use crate::shard::ShardContext;

pub struct WorkflowContext {
    identifier: WorkflowIdentifier,
    shard: Arc<ShardContext>,
    domains: Arc<dyn DomainResolver>,
    inner: tokio::sync::Mutex<Option<MutableState>>,
    byte_size: AtomicUsize,
    pub(crate) last_access: AtomicU64,
}

impl WorkflowContext {
    pub fn new(
        identifier: WorkflowIdentifier,
        shard: Arc<ShardContext>,
        domains: Arc<dyn DomainResolver>,
    ) -> Self {
        Self {
            identifier,
            shard,
            domains,
            inner: tokio::sync::Mutex::new(None),
            byte_size: AtomicUsize::new(0),
            last_access: AtomicU64::new(0),
        }
    }

    pub fn identifier(&self) -> &WorkflowIdentifier {
        &self.identifier
    }

    pub fn shard(&self) -> &Arc<ShardContext> {
        &self.shard
    }

    /// Estimated bytes held by the cached state.
    pub fn byte_size(&self) -> usize {
        self.byte_size.load(Ordering::Relaxed)
    }

    /// Whether the exclusive lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    /// Acquire the exclusive lock, honoring cancellation.
    pub async fn lock(&self, cancellation: &CancellationToken) -> EngineResult<WorkflowHandle<'_>> {
        let guard = tokio::select! {
            guard = self.inner.lock() => guard,
            _ = cancellation.cancelled() => return Err(EngineError::Cancelled),
        };
        Ok(WorkflowHandle {
            context: self,
            guard,
        })
    }
}

pub struct WorkflowHandle<'a> {
    context: &'a WorkflowContext,
    guard: tokio::sync::MutexGuard<'a, Option<MutableState>>,
}

impl std::fmt::Debug for WorkflowHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHandle").finish_non_exhaustive()
    }
}

impl WorkflowHandle<'_> {
    /// (Re)hydrate the mutable state from persistence if not cached.
    pub async fn load(&mut self) -> EngineResult<&mut MutableState> {
        if self.guard.is_none() {
            let snapshot = self
                .context
                .shard
                .get_workflow_execution(&self.context.identifier)
                .await?;
            let replication_enabled = self
                .context
                .domains
                .domain_by_id(&self.context.identifier.domain_id)
                .map(|entry| entry.is_global())
                .unwrap_or(false);
            let state = MutableState::from_snapshot(snapshot, replication_enabled)?;
            self.context
                .byte_size
                .store(state.estimated_size(), Ordering::Relaxed);
            *self.guard = Some(state);
        }
        Ok(self.guard.as_mut().expect("state just hydrated"))
    }

    /// Drop the cached state so the next reader reloads from persistence.
    pub fn clear(&mut self) {
        debug!(identifier = %self.context.identifier, "clearing cached mutable state");
        *self.guard = None;
        self.context.byte_size.store(0, Ordering::Relaxed);
    }

    /// Swap a rebuilt mutable state into this handle (conflict-resolution
    /// forks construct state out of band).
    pub fn install(&mut self, state: MutableState) {
        self.context
            .byte_size
            .store(state.estimated_size(), Ordering::Relaxed);
        *self.guard = Some(state);
    }

    /// Persist a brand-new run held in this handle.
    pub async fn create_workflow(
        &mut self,
        mut state: MutableState,
        mode: CreateWorkflowMode,
        policy: TransactionPolicy,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let (mut mutation, events) = match policy {
            TransactionPolicy::Active => state.close_transaction_as_active(now)?,
            TransactionPolicy::Passive => state.close_transaction_as_passive(now)?,
        };
        let task_count = mutation.transfer_tasks.len()
            + mutation.timer_tasks.len()
            + mutation.replication_tasks.len();
        let mut task_ids = self.context.shard.allocate_task_ids(task_count)?.into_iter();
        for task in &mut mutation.transfer_tasks {
            task.task_id = task_ids.next().expect("allocated above");
        }
        for task in &mut mutation.timer_tasks {
            task.task_id = task_ids.next().expect("allocated above");
        }
        for task in &mut mutation.replication_tasks {
            task.task_id = task_ids.next().expect("allocated above");
        }
        if !events.is_empty() {
            let branch_token = mutation
                .version_histories
                .as_ref()
                .map(|histories| histories.current().branch_token.clone())
                .unwrap_or_default();
            if let Ok(token) =
                meridian_persistence::HistoryBranchToken::decode(&branch_token)
            {
                let identifier = &self.context.identifier;
                self.context
                    .shard
                    .create_history_branch(
                        &token,
                        meridian_persistence::encode_cleanup_info(
                            &identifier.domain_id,
                            &identifier.workflow_id,
                            identifier.run_id,
                        ),
                    )
                    .await?;
            }
            self.context
                .shard
                .append_history_events(&branch_token, &events)
                .await?;
        }
        let result = self
            .context
            .shard
            .create_workflow_execution(
                mode,
                state.snapshot(),
                mutation.transfer_tasks,
                mutation.timer_tasks,
                mutation.replication_tasks,
            )
            .await;
        if let Err(err) = result {
            if err.invalidates_cache() {
                self.clear();
            }
            return Err(err);
        }
        self.context
            .byte_size
            .store(state.estimated_size(), Ordering::Relaxed);
        *self.guard = Some(state);
        Ok(())
    }

    /// Close the transaction on the active path and persist it.
    pub async fn update_as_active(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        self.update(now, UpdateWorkflowMode::UpdateCurrent, true).await
    }

    /// Close the transaction on the passive path and persist it with the
    /// given current-run mode.
    pub async fn update_as_passive(
        &mut self,
        now: DateTime<Utc>,
        mode: UpdateWorkflowMode,
    ) -> EngineResult<()> {
        self.update(now, mode, false).await
    }

    async fn update(
        &mut self,
        now: DateTime<Utc>,
        mode: UpdateWorkflowMode,
        active: bool,
    ) -> EngineResult<()> {
        let result = self.update_inner(now, mode, active).await;
        if let Err(err) = &result {
            if err.invalidates_cache() || matches!(err, EngineError::Invariant(_)) {
                self.clear();
            }
        }
        result
    }

    async fn update_inner(
        &mut self,
        now: DateTime<Utc>,
        mode: UpdateWorkflowMode,
        active: bool,
    ) -> EngineResult<()> {
        let state = self
            .guard
            .as_mut()
            .ok_or_else(|| EngineError::Invariant("update without loaded state".to_string()))?;
        let (mut mutation, events) = if active {
            state.close_transaction_as_active(now)?
        } else {
            state.close_transaction_as_passive(now)?
        };

        let task_count = mutation.transfer_tasks.len()
            + mutation.timer_tasks.len()
            + mutation.replication_tasks.len()
            + mutation.cross_cluster_tasks.len();
        let mut task_ids = self.context.shard.allocate_task_ids(task_count)?.into_iter();
        for task in &mut mutation.transfer_tasks {
            task.task_id = task_ids.next().expect("allocated above");
        }
        for task in &mut mutation.timer_tasks {
            task.task_id = task_ids.next().expect("allocated above");
        }
        for task in &mut mutation.replication_tasks {
            task.task_id = task_ids.next().expect("allocated above");
        }
        for task in &mut mutation.cross_cluster_tasks {
            task.task_id = task_ids.next().expect("allocated above");
        }

        if !events.is_empty() {
            let branch_token = mutation
                .version_histories
                .as_ref()
                .map(|histories| histories.current().branch_token.clone())
                .unwrap_or_default();
            self.context
                .shard
                .append_history_events(&branch_token, &events)
                .await?;
        }

        self.context
            .shard
            .update_workflow_execution(mode, mutation, None)
            .await?;
        self.context
            .byte_size
            .store(state.estimated_size(), Ordering::Relaxed);
        Ok(())
    }
}
