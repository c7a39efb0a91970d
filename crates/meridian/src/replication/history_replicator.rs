//! Passive application of remote event batches.
//!
//! Incoming batches carry the sender's version history. The local cluster
//! lines that history up against its own branches and either appends,
//! forks, discards, or asks the sender to resend a range. Derived state is
//! rebuilt from the shared prefix whenever the current branch changes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use meridian_persistence::{
    encode_cleanup_info, EventKind, HistoryBranchToken, HistoryEvent, UpdateWorkflowMode,
    WorkflowState,
};
use meridian_version_history::{
    VersionHistories, VersionHistory, VersionHistoryError, VersionHistoryItem, FIRST_EVENT_ID,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult, RetryTaskError};
use crate::execution::{ExecutionCache, MutableState, TransactionPolicy, WorkflowHandle};
use crate::replication::messages::ReplicateEventsRequest;
use crate::replication::{RESEND_HIGHER_VERSION, RESEND_MISSING_EVENTS};
use crate::shard::ShardContext;

pub struct HistoryReplicator {
    cache: Arc<ExecutionCache>,
    shard: Arc<ShardContext>,
}

impl HistoryReplicator {
    pub fn new(cache: Arc<ExecutionCache>, shard: Arc<ShardContext>) -> Self {
        Self { cache, shard }
    }

    pub async fn replicate_events(
        &self,
        cancellation: &CancellationToken,
        request: ReplicateEventsRequest,
    ) -> EngineResult<()> {
        if request.events.is_empty() || request.version_history_items.is_empty() {
            return Err(EngineError::Invariant(
                "replication batch without events or version history".to_string(),
            ));
        }
        let identifier = request.identifier();
        let context = self.cache.get_or_create(&identifier);
        let mut handle = context.lock(cancellation).await?;

        match handle.load().await {
            Ok(_) => self.apply_to_existing(&mut handle, request).await,
            Err(err) if err.is_not_found() => self.create_run(&mut handle, request).await,
            Err(err) => Err(err),
        }
    }

    /// First contact with this run: the batch must start at event one.
    async fn create_run(
        &self,
        handle: &mut WorkflowHandle<'_>,
        request: ReplicateEventsRequest,
    ) -> EngineResult<()> {
        let first = &request.events[0];
        if first.event_id != FIRST_EVENT_ID {
            return Err(RetryTaskError {
                message: RESEND_MISSING_EVENTS,
                domain_id: request.domain_id,
                workflow_id: request.workflow_id,
                run_id: request.run_id,
                start_event_id: None,
                start_event_version: None,
                end_event_id: Some(first.event_id),
                end_event_version: Some(first.version),
            }
            .into());
        }
        if first.kind != EventKind::WorkflowStarted {
            return Err(EngineError::Invariant(format!(
                "run {} begins with {:?}, not a start event",
                request.run_id, first.kind
            )));
        }

        let now = batch_time(&request.events);
        let payload = &first.payload;
        let mut state = MutableState::start(
            request.domain_id.clone(),
            request.workflow_id.clone(),
            request.run_id,
            payload["task_list"].as_str().unwrap_or_default(),
            payload["workflow_type"].as_str().unwrap_or_default(),
            payload_seconds(payload, "execution_timeout_seconds"),
            payload_seconds(payload, "task_timeout_seconds"),
            first.version,
            true,
            first.timestamp,
        );
        state.replicate_events_to_current(request.events)?;

        // A run already current for this workflow id makes the new one a
        // zombie until its branch wins.
        let mode = match self
            .shard
            .get_current_run_id(&request.domain_id, &request.workflow_id)
            .await
        {
            Ok(_) => {
                state.convert_to_zombie();
                meridian_persistence::CreateWorkflowMode::BypassCurrent
            }
            Err(err) if err.is_not_found() => {
                meridian_persistence::CreateWorkflowMode::UpdateCurrent
            }
            Err(err) => return Err(err),
        };
        info!(run_id = %request.run_id, workflow_id = %request.workflow_id,
            "creating replicated run");
        handle
            .create_workflow(state, mode, TransactionPolicy::Passive, now)
            .await
    }

    async fn apply_to_existing(
        &self,
        handle: &mut WorkflowHandle<'_>,
        request: ReplicateEventsRequest,
    ) -> EngineResult<()> {
        let incoming = VersionHistory::new(Vec::new(), request.version_history_items.clone());
        let now = batch_time(&request.events);

        let state = handle.load().await?;
        let histories = state
            .version_histories()
            .ok_or_else(|| {
                EngineError::Invariant(
                    "event replication against a run without version histories".to_string(),
                )
            })?
            .clone();

        let (index, lca) = match histories.find_lca(&incoming) {
            Ok(found) => found,
            Err(VersionHistoryError::NoCommonAncestor) => {
                let first_item = incoming.first_item()?;
                return Err(RetryTaskError {
                    message: RESEND_MISSING_EVENTS,
                    domain_id: request.domain_id,
                    workflow_id: request.workflow_id,
                    run_id: request.run_id,
                    start_event_id: None,
                    start_event_version: None,
                    end_event_id: Some(first_item.event_id),
                    end_event_version: Some(first_item.version),
                }
                .into());
            }
            Err(err) => return Err(err.into()),
        };
        let retry = |message: &'static str, start: VersionHistoryItem| {
            EngineError::from(RetryTaskError {
                message,
                domain_id: request.domain_id.clone(),
                workflow_id: request.workflow_id.clone(),
                run_id: request.run_id,
                start_event_id: Some(start.event_id),
                start_event_version: Some(start.version),
                end_event_id: None,
                end_event_version: None,
            })
        };

        let incoming_tip = incoming.last_item()?;
        let branch = histories.history(index)?;
        let branch_tip = branch.last_item()?;
        if branch.contains(incoming_tip) {
            debug!(run_id = %request.run_id, "duplicate replication batch discarded");
            return Ok(());
        }

        let current_index = histories.current_index();
        let current_tip = histories.current().last_item()?;
        let first_event = &request.events[0];

        if lca == branch_tip {
            // The batch extends branch `index`.
            if first_event.event_id > branch_tip.event_id + 1 {
                return Err(retry(RESEND_MISSING_EVENTS, branch_tip));
            }
            let fresh: Vec<HistoryEvent> = request
                .events
                .iter()
                .filter(|event| event.event_id > branch_tip.event_id)
                .cloned()
                .collect();
            if fresh.is_empty() {
                return Ok(());
            }
            if index == current_index {
                let state = handle.load().await?;
                state.replicate_events_to_current(fresh)?;
                let mode = passive_mode(state.state());
                return handle.update_as_passive(now, mode).await;
            }
            if incoming_tip.version > current_tip.version {
                // The side branch overtakes: it becomes current.
                return self
                    .promote_branch(handle, &histories, index, fresh, now)
                    .await;
            }
            // Record the side branch's progress without touching derived
            // state.
            let branch_token = branch.branch_token.clone();
            self.shard.append_history_events(&branch_token, &fresh).await?;
            let state = handle.load().await?;
            let mode = passive_mode(state.state());
            let side_histories = state.version_histories_mut().ok_or_else(|| {
                EngineError::Invariant("version histories vanished mid-apply".to_string())
            })?;
            let side = side_histories.history_mut(index)?;
            for event in &fresh {
                side.update(VersionHistoryItem::new(event.event_id, event.version))?;
            }
            return handle.update_as_passive(now, mode).await;
        }

        // Divergence below the tip of branch `index`.
        if incoming_tip.version > current_tip.version {
            if first_event.event_id != lca.event_id + 1 {
                return Err(retry(RESEND_MISSING_EVENTS, lca));
            }
            return self
                .fork_and_apply(handle, &histories, index, lca, request.events, now)
                .await;
        }
        if incoming_tip.version < current_tip.version {
            debug!(run_id = %request.run_id, "replication batch dominated by local branch");
            return Ok(());
        }
        Err(retry(RESEND_HIGHER_VERSION, lca))
    }

    /// A non-current branch grew past the current one: append its events,
    /// rebuild derived state from its history, and mark it current.
    async fn promote_branch(
        &self,
        handle: &mut WorkflowHandle<'_>,
        histories: &VersionHistories,
        index: usize,
        fresh: Vec<HistoryEvent>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let branch = histories.history(index)?;
        let branch_token = branch.branch_token.clone();
        let branch_tip = branch.last_item()?;
        self.shard.append_history_events(&branch_token, &fresh).await?;

        let prefix = self
            .shard
            .get_history_events(&branch_token, FIRST_EVENT_ID, branch_tip.event_id)
            .await?;

        let mut merged = histories.clone();
        {
            let side = merged.history_mut(index)?;
            for event in &fresh {
                side.update(VersionHistoryItem::new(event.event_id, event.version))?;
            }
        }
        merged.set_current_index(index)?;

        info!(index, "promoting replicated branch to current");
        self.rebuild_and_persist(handle, merged, prefix, fresh, now).await
    }

    /// The batch diverges mid-branch with a higher version: fork the shared
    /// prefix into a new branch, apply the events there, make it current.
    async fn fork_and_apply(
        &self,
        handle: &mut WorkflowHandle<'_>,
        histories: &VersionHistories,
        index: usize,
        lca: VersionHistoryItem,
        events: Vec<HistoryEvent>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let source = histories.history(index)?;
        let source_token = source.branch_token.clone();

        let state = handle.load().await?;
        let info = state.execution_info().clone();

        let new_token = HistoryBranchToken {
            tree_id: info.run_id,
            branch_id: Uuid::new_v4(),
        };
        self.shard
            .fork_history_branch(
                &source_token,
                &new_token,
                lca.event_id,
                encode_cleanup_info(&info.domain_id, &info.workflow_id, info.run_id),
            )
            .await?;
        self.shard
            .append_history_events(&new_token.encode(), &events)
            .await?;

        let prefix = self
            .shard
            .get_history_events(&source_token, FIRST_EVENT_ID, lca.event_id)
            .await?;

        // Version history of the new branch falls out of the replay; only
        // its token is fixed here.
        let mut replayed = VersionHistory::new(new_token.encode(), Vec::new());
        for event in prefix.iter().chain(&events) {
            replayed.update(VersionHistoryItem::new(event.event_id, event.version))?;
        }
        let mut merged = histories.clone();
        let new_index = merged.add(replayed);
        merged.set_current_index(new_index)?;

        info!(fork_event_id = lca.event_id, "forked new current branch");
        self.rebuild_and_persist(handle, merged, prefix, events, now).await
    }

    /// Replay `prefix + fresh` into a fresh mutable state, install the
    /// merged branch set, and persist under the loaded state's condition.
    async fn rebuild_and_persist(
        &self,
        handle: &mut WorkflowHandle<'_>,
        merged: VersionHistories,
        prefix: Vec<HistoryEvent>,
        fresh: Vec<HistoryEvent>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let state = handle.load().await?;
        let info = state.execution_info().clone();
        let condition = state.next_event_id();
        let was_zombie = info.state == WorkflowState::Zombie;

        let started = prefix
            .first()
            .ok_or_else(|| EngineError::Invariant("rebuild without a start event".to_string()))?;
        let mut rebuilt = MutableState::start(
            info.domain_id.clone(),
            info.workflow_id.clone(),
            info.run_id,
            info.task_list.clone(),
            info.workflow_type.clone(),
            info.execution_timeout,
            info.task_timeout,
            started.version,
            true,
            info.start_time,
        );
        rebuilt.replicate_events_to_current(prefix)?;
        rebuilt.replicate_events_to_current(fresh)?;
        // Everything replayed is already persisted in its branch.
        rebuilt.clear_pending_events();
        rebuilt.replace_version_histories(merged);
        rebuilt.set_condition(condition);
        if was_zombie {
            rebuilt.convert_to_zombie();
        }
        let mode = passive_mode(rebuilt.state());
        handle.install(rebuilt);
        handle.update_as_passive(now, mode).await
    }
}

fn passive_mode(state: WorkflowState) -> UpdateWorkflowMode {
    if state == WorkflowState::Zombie {
        UpdateWorkflowMode::BypassCurrent
    } else {
        UpdateWorkflowMode::UpdateCurrent
    }
}

fn batch_time(events: &[HistoryEvent]) -> DateTime<Utc> {
    events
        .last()
        .map(|event| event.timestamp)
        .unwrap_or_else(Utc::now)
}

fn payload_seconds(payload: &serde_json::Value, key: &str) -> std::time::Duration {
    std::time::Duration::from_secs(payload[key].as_u64().unwrap_or_default())
}
