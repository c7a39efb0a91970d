//! In-memory mutable state of one workflow run.
//!
//! Mutations arrive from the active path (local decisions and activities) or
//! the passive path (events replicated from a peer cluster). Either way the
//! flow is the same: mutate in memory, buffer the tasks to emit, then close
//! the transaction to produce a conditional persistence write. Invariants
//! are validated on every close; nothing is persisted past a violation.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use meridian_persistence::{
    ActivityInfo, ChildExecutionInfo, CloseStatus, CrossClusterTask, EventKind, HistoryEvent,
    ReplicationTask, ReplicationTaskKind, TimerInfo, TimerTask, TimerTaskKind, TransferTask,
    TransferTaskKind, WorkflowExecutionInfo, WorkflowIdentifier, WorkflowMutation, WorkflowSnapshot,
    WorkflowState, EMPTY_EVENT_ID,
};
use meridian_version_history::{
    VersionHistories, VersionHistory, VersionHistoryItem, FIRST_EVENT_ID,
};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Whether a close registers outbound replication tasks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionPolicy {
    Active,
    Passive,
}

/// An event the active path wants appended; ids and versions are assigned
/// by the state machine.
#[derive(Clone, Debug)]
pub struct NewEvent {
    pub kind: EventKind,
    pub payload: Value,
}

#[derive(Debug)]
pub struct MutableState {
    execution_info: WorkflowExecutionInfo,
    activity_infos: HashMap<i64, ActivityInfo>,
    timer_infos: HashMap<String, TimerInfo>,
    child_execution_infos: HashMap<i64, ChildExecutionInfo>,
    signal_requested_ids: HashSet<Uuid>,
    version_histories: Option<VersionHistories>,
    current_version: i64,
    last_write_version: i64,
    /// Whether the domain replicates to peer clusters.
    replication_enabled: bool,
    /// `next_event_id` as last observed in storage; the close condition.
    condition: i64,

    pending_events: Vec<HistoryEvent>,
    upsert_activity_ids: HashSet<i64>,
    deleted_activity_ids: Vec<i64>,
    upsert_timer_ids: HashSet<String>,
    deleted_timer_ids: Vec<String>,
    transfer_tasks: Vec<TransferTask>,
    timer_tasks: Vec<TimerTask>,
    cross_cluster_tasks: Vec<CrossClusterTask>,
}

impl MutableState {
    /// Fresh run in `Created` state with an empty current branch.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        domain_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: Uuid,
        task_list: impl Into<String>,
        workflow_type: impl Into<String>,
        execution_timeout: std::time::Duration,
        task_timeout: std::time::Duration,
        version: i64,
        replication_enabled: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let branch_token = meridian_persistence::HistoryBranchToken {
            tree_id: run_id,
            branch_id: Uuid::new_v4(),
        }
        .encode();
        Self {
            execution_info: WorkflowExecutionInfo {
                domain_id: domain_id.into(),
                workflow_id: workflow_id.into(),
                run_id,
                task_list: task_list.into(),
                workflow_type: workflow_type.into(),
                execution_timeout,
                task_timeout,
                state: WorkflowState::Created,
                close_status: CloseStatus::None,
                next_event_id: FIRST_EVENT_ID,
                last_first_event_id: FIRST_EVENT_ID,
                last_event_task_id: 0,
                start_time: now,
                last_updated_time: now,
            },
            activity_infos: HashMap::new(),
            timer_infos: HashMap::new(),
            child_execution_infos: HashMap::new(),
            signal_requested_ids: HashSet::new(),
            version_histories: Some(VersionHistories::new(VersionHistory::new(
                branch_token,
                Vec::new(),
            ))),
            current_version: version,
            last_write_version: version,
            replication_enabled,
            condition: FIRST_EVENT_ID,
            pending_events: Vec::new(),
            upsert_activity_ids: HashSet::new(),
            deleted_activity_ids: Vec::new(),
            upsert_timer_ids: HashSet::new(),
            deleted_timer_ids: Vec::new(),
            transfer_tasks: Vec::new(),
            timer_tasks: Vec::new(),
            cross_cluster_tasks: Vec::new(),
        }
    }

    /// Hydrate from a storage snapshot, asserting the version-history
    /// invariants hold.
    pub fn from_snapshot(
        snapshot: WorkflowSnapshot,
        replication_enabled: bool,
    ) -> EngineResult<Self> {
        let current_version = match &snapshot.version_histories {
            Some(histories) => {
                let current = histories.current();
                if !current.is_empty() {
                    let tip = current.last_item()?;
                    if tip.event_id + 1 != snapshot.execution_info.next_event_id {
                        return Err(EngineError::Invariant(format!(
                            "run {}: branch tip {} disagrees with next event id {}",
                            snapshot.execution_info.identifier(),
                            tip.event_id,
                            snapshot.execution_info.next_event_id,
                        )));
                    }
                    tip.version
                } else {
                    snapshot.last_write_version
                }
            }
            None => snapshot.last_write_version,
        };
        let condition = snapshot.execution_info.next_event_id;
        Ok(Self {
            execution_info: snapshot.execution_info,
            activity_infos: snapshot.activity_infos,
            timer_infos: snapshot.timer_infos,
            child_execution_infos: snapshot.child_execution_infos,
            signal_requested_ids: snapshot.signal_requested_ids,
            version_histories: snapshot.version_histories,
            current_version,
            last_write_version: snapshot.last_write_version,
            replication_enabled,
            condition,
            pending_events: Vec::new(),
            upsert_activity_ids: HashSet::new(),
            deleted_activity_ids: Vec::new(),
            upsert_timer_ids: HashSet::new(),
            deleted_timer_ids: Vec::new(),
            transfer_tasks: Vec::new(),
            timer_tasks: Vec::new(),
            cross_cluster_tasks: Vec::new(),
        })
    }

    pub fn identifier(&self) -> WorkflowIdentifier {
        self.execution_info.identifier()
    }

    pub fn execution_info(&self) -> &WorkflowExecutionInfo {
        &self.execution_info
    }

    pub fn is_running(&self) -> bool {
        self.execution_info.is_running()
    }

    pub fn state(&self) -> WorkflowState {
        self.execution_info.state
    }

    pub fn close_status(&self) -> CloseStatus {
        self.execution_info.close_status
    }

    pub fn next_event_id(&self) -> i64 {
        self.execution_info.next_event_id
    }

    pub fn current_version(&self) -> i64 {
        self.current_version
    }

    pub fn last_write_version(&self) -> i64 {
        self.last_write_version
    }

    pub fn version_histories(&self) -> Option<&VersionHistories> {
        self.version_histories.as_ref()
    }

    pub fn version_histories_mut(&mut self) -> Option<&mut VersionHistories> {
        self.version_histories.as_mut()
    }

    pub fn get_activity_info(&self, schedule_id: i64) -> Option<&ActivityInfo> {
        self.activity_infos.get(&schedule_id)
    }

    pub fn pending_activity_count(&self) -> usize {
        self.activity_infos.len()
    }

    /// Mark the run as a replication-only zombie (not current for its
    /// workflow id).
    pub fn convert_to_zombie(&mut self) {
        self.execution_info.state = WorkflowState::Zombie;
    }

    /// Branch surgery during conflict resolution: install the merged set of
    /// branches after a fork. The current branch must already agree with
    /// this state's event bookkeeping.
    pub(crate) fn replace_version_histories(&mut self, histories: VersionHistories) {
        self.version_histories = Some(histories);
    }

    /// Pin the close condition to the `next_event_id` currently stored, for
    /// states rebuilt in memory rather than loaded.
    pub(crate) fn set_condition(&mut self, condition: i64) {
        self.condition = condition;
    }

    /// Drop buffered events whose storage writes already happened (branch
    /// fork copies).
    pub(crate) fn clear_pending_events(&mut self) {
        self.pending_events.clear();
    }

    pub fn promote_from_zombie(&mut self) {
        if self.execution_info.state == WorkflowState::Zombie {
            self.execution_info.state = WorkflowState::Running;
        }
    }

    /// Rough per-entry byte accounting for cache eviction.
    pub fn estimated_size(&self) -> usize {
        let details: usize = self
            .activity_infos
            .values()
            .map(|info| info.details.len())
            .sum();
        512 + self.activity_infos.len() * 256
            + self.timer_infos.len() * 128
            + self.child_execution_infos.len() * 128
            + self.pending_events.len() * 512
            + details
    }

    // ---- active path ----------------------------------------------------

    /// Append events produced locally: assign dense ids under the current
    /// failover version, apply side effects, and buffer the matching tasks.
    pub fn apply_events(&mut self, events: Vec<NewEvent>, now: DateTime<Utc>) -> EngineResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.execution_info.last_first_event_id = self.execution_info.next_event_id;
        for new_event in events {
            let event = HistoryEvent {
                event_id: self.execution_info.next_event_id,
                version: self.current_version,
                timestamp: now,
                kind: new_event.kind,
                payload: new_event.payload,
            };
            self.push_event(event, TransactionPolicy::Active)?;
        }
        Ok(())
    }

    // ---- passive path ---------------------------------------------------

    /// Append events replicated onto the current branch. Event ids must
    /// continue the branch exactly; callers resolve gaps and forks first.
    pub fn replicate_events_to_current(
        &mut self,
        events: Vec<HistoryEvent>,
    ) -> EngineResult<()> {
        if let Some(first) = events.first() {
            self.execution_info.last_first_event_id = first.event_id;
        }
        for event in events {
            if event.event_id != self.execution_info.next_event_id {
                return Err(EngineError::Invariant(format!(
                    "run {}: replicated event {} does not continue next event id {}",
                    self.execution_info.identifier(),
                    event.event_id,
                    self.execution_info.next_event_id,
                )));
            }
            self.current_version = event.version;
            self.push_event(event, TransactionPolicy::Passive)?;
        }
        Ok(())
    }

    fn push_event(&mut self, event: HistoryEvent, policy: TransactionPolicy) -> EngineResult<()> {
        if let Some(histories) = self.version_histories.as_mut() {
            histories
                .current_mut()
                .update(VersionHistoryItem::new(event.event_id, event.version))?;
        }
        self.apply_event_side_effects(&event, policy)?;
        self.execution_info.next_event_id = event.event_id + 1;
        self.last_write_version = event.version;
        self.pending_events.push(event);
        Ok(())
    }

    fn apply_event_side_effects(
        &mut self,
        event: &HistoryEvent,
        policy: TransactionPolicy,
    ) -> EngineResult<()> {
        match event.kind {
            EventKind::WorkflowStarted => {
                self.execution_info.state = WorkflowState::Running;
                self.execution_info.start_time = event.timestamp;
            }
            EventKind::ActivityScheduled => {
                let activity_id = payload_str(&event.payload, "activity_id");
                let info = ActivityInfo {
                    version: event.version,
                    schedule_id: event.event_id,
                    scheduled_time: event.timestamp,
                    started_id: EMPTY_EVENT_ID,
                    started_time: None,
                    activity_id: activity_id.clone(),
                    attempt: 0,
                    last_heartbeat_time: None,
                    details: Vec::new(),
                    schedule_to_close_timeout: payload_duration(
                        &event.payload,
                        "schedule_to_close_seconds",
                    ),
                    start_to_close_timeout: payload_duration(
                        &event.payload,
                        "start_to_close_seconds",
                    ),
                    heartbeat_timeout: payload_duration(&event.payload, "heartbeat_seconds"),
                    maximum_attempts: event.payload["maximum_attempts"].as_i64().unwrap_or(0)
                        as i32,
                    expiration_time: None,
                };
                self.upsert_activity_ids.insert(event.event_id);
                self.activity_infos.insert(event.event_id, info);
                if policy == TransactionPolicy::Active {
                    self.transfer_tasks.push(TransferTask {
                        task_id: 0,
                        identifier: self.execution_info.identifier(),
                        version: event.version,
                        kind: TransferTaskKind::ActivityTask {
                            task_list: self.execution_info.task_list.clone(),
                            schedule_id: event.event_id,
                        },
                    });
                }
            }
            EventKind::ActivityStarted => {
                let schedule_id = payload_i64(&event.payload, "schedule_id");
                if let Some(info) = self.activity_infos.get_mut(&schedule_id) {
                    info.started_id = event.event_id;
                    info.started_time = Some(event.timestamp);
                    info.version = event.version;
                    self.upsert_activity_ids.insert(schedule_id);
                }
            }
            EventKind::ActivityCompleted
            | EventKind::ActivityFailed
            | EventKind::ActivityTimedOut => {
                let schedule_id = payload_i64(&event.payload, "schedule_id");
                if self.activity_infos.remove(&schedule_id).is_some() {
                    self.upsert_activity_ids.remove(&schedule_id);
                    self.deleted_activity_ids.push(schedule_id);
                }
            }
            EventKind::TimerStarted => {
                let timer_id = payload_str(&event.payload, "timer_id");
                let expiry = event.timestamp
                    + ChronoDuration::seconds(payload_i64(&event.payload, "timeout_seconds"));
                self.upsert_timer_ids.insert(timer_id.clone());
                self.timer_infos.insert(
                    timer_id.clone(),
                    TimerInfo {
                        timer_id: timer_id.clone(),
                        version: event.version,
                        started_id: event.event_id,
                        expiry_time: expiry,
                    },
                );
                if policy == TransactionPolicy::Active {
                    self.timer_tasks.push(TimerTask {
                        task_id: 0,
                        visibility_time: expiry,
                        identifier: self.execution_info.identifier(),
                        version: event.version,
                        kind: TimerTaskKind::UserTimer { timer_id },
                    });
                }
            }
            EventKind::TimerFired | EventKind::TimerCanceled => {
                let timer_id = payload_str(&event.payload, "timer_id");
                if self.timer_infos.remove(&timer_id).is_some() {
                    self.upsert_timer_ids.remove(&timer_id);
                    self.deleted_timer_ids.push(timer_id);
                }
            }
            EventKind::DecisionScheduled => {
                if policy == TransactionPolicy::Active {
                    self.transfer_tasks.push(TransferTask {
                        task_id: 0,
                        identifier: self.execution_info.identifier(),
                        version: event.version,
                        kind: TransferTaskKind::DecisionTask {
                            task_list: self.execution_info.task_list.clone(),
                            schedule_id: event.event_id,
                        },
                    });
                }
            }
            EventKind::DecisionStarted | EventKind::DecisionCompleted
            | EventKind::SignalReceived => {}
            kind => {
                if let Some(close_status) = kind.close_status() {
                    self.execution_info.state = WorkflowState::Completed;
                    self.execution_info.close_status = close_status;
                    if policy == TransactionPolicy::Active {
                        self.transfer_tasks.push(TransferTask {
                            task_id: 0,
                            identifier: self.execution_info.identifier(),
                            version: event.version,
                            kind: TransferTaskKind::CloseExecution,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    // ---- activity replication -------------------------------------------

    /// Apply a remote activity snapshot. With `resurrect`, a schedule id
    /// whose local entry was pruned is rebuilt from the remote fields;
    /// without it, a missing entry is a caller bug.
    pub fn replicate_activity_info(
        &mut self,
        request: &crate::replication::SyncActivityRequest,
        resurrect: bool,
    ) -> EngineResult<()> {
        let mut info = match self.activity_infos.get(&request.scheduled_id) {
            Some(info) => info.clone(),
            None if resurrect => ActivityInfo {
                version: request.version,
                schedule_id: request.scheduled_id,
                scheduled_time: request
                    .scheduled_time
                    .unwrap_or(self.execution_info.start_time),
                started_id: EMPTY_EVENT_ID,
                started_time: None,
                activity_id: String::new(),
                attempt: 0,
                last_heartbeat_time: None,
                details: Vec::new(),
                schedule_to_close_timeout: std::time::Duration::ZERO,
                start_to_close_timeout: std::time::Duration::ZERO,
                heartbeat_timeout: std::time::Duration::ZERO,
                maximum_attempts: 0,
                expiration_time: None,
            },
            None => {
                return Err(EngineError::Invariant(format!(
                    "run {}: no pending activity {} to replicate",
                    self.execution_info.identifier(),
                    request.scheduled_id,
                )));
            }
        };
        info.version = request.version;
        if let Some(scheduled_time) = request.scheduled_time {
            info.scheduled_time = scheduled_time;
        }
        info.started_id = request.started_id;
        info.started_time = request.started_time;
        info.attempt = request.attempt;
        info.last_heartbeat_time = request.last_heartbeat_time;
        info.details = request.details.clone();
        self.update_activity(info);
        Ok(())
    }

    /// Upsert an activity snapshot; buffers the write.
    pub fn update_activity(&mut self, info: ActivityInfo) {
        self.upsert_activity_ids.insert(info.schedule_id);
        self.activity_infos.insert(info.schedule_id, info);
    }

    /// Retry timer for a replicated activity, sized by the remote
    /// timestamps: the latest known remote progress plus the activity's own
    /// timeout budget.
    pub fn next_activity_retry_timer(&self, schedule_id: i64) -> Option<TimerTask> {
        let info = self.activity_infos.get(&schedule_id)?;
        let base = info
            .last_heartbeat_time
            .or(info.started_time)
            .unwrap_or(info.scheduled_time);
        let budget = if info.heartbeat_timeout > std::time::Duration::ZERO {
            info.heartbeat_timeout
        } else {
            info.start_to_close_timeout
        };
        let visibility_time =
            base + ChronoDuration::from_std(budget).unwrap_or_else(|_| ChronoDuration::zero());
        Some(TimerTask {
            task_id: 0,
            visibility_time,
            identifier: self.execution_info.identifier(),
            version: info.version,
            kind: TimerTaskKind::ActivityRetryTimer {
                schedule_id,
                attempt: info.attempt,
            },
        })
    }

    pub fn add_timer_task(&mut self, task: TimerTask) {
        self.timer_tasks.push(task);
    }

    pub fn add_transfer_task(&mut self, task: TransferTask) {
        self.transfer_tasks.push(task);
    }

    // ---- transaction close ----------------------------------------------

    pub fn close_transaction_as_active(
        &mut self,
        now: DateTime<Utc>,
    ) -> EngineResult<(WorkflowMutation, Vec<HistoryEvent>)> {
        self.close_transaction(TransactionPolicy::Active, now)
    }

    pub fn close_transaction_as_passive(
        &mut self,
        now: DateTime<Utc>,
    ) -> EngineResult<(WorkflowMutation, Vec<HistoryEvent>)> {
        self.close_transaction(TransactionPolicy::Passive, now)
    }

    fn close_transaction(
        &mut self,
        policy: TransactionPolicy,
        now: DateTime<Utc>,
    ) -> EngineResult<(WorkflowMutation, Vec<HistoryEvent>)> {
        self.validate()?;
        self.execution_info.last_updated_time = now;

        let events = std::mem::take(&mut self.pending_events);
        let mut replication_tasks = Vec::new();
        if policy == TransactionPolicy::Active
            && self.replication_enabled
            && !events.is_empty()
        {
            let branch_token = self
                .version_histories
                .as_ref()
                .map(|histories| histories.current().branch_token.clone())
                .unwrap_or_default();
            replication_tasks.push(ReplicationTask {
                task_id: 0,
                identifier: self.execution_info.identifier(),
                kind: ReplicationTaskKind::History {
                    first_event_id: events[0].event_id,
                    next_event_id: self.execution_info.next_event_id,
                    version: self.current_version,
                    branch_token,
                },
            });
        }

        let upsert_ids: Vec<i64> = self.upsert_activity_ids.drain().collect();
        let upserts: Vec<ActivityInfo> = upsert_ids
            .iter()
            .filter_map(|id| self.activity_infos.get(id).cloned())
            .collect();
        let timer_ids: Vec<String> = self.upsert_timer_ids.drain().collect();
        let timer_upserts: Vec<TimerInfo> = timer_ids
            .iter()
            .filter_map(|id| self.timer_infos.get(id).cloned())
            .collect();

        let mutation = WorkflowMutation {
            execution_info: self.execution_info.clone(),
            upsert_activity_infos: upserts,
            delete_activity_ids: std::mem::take(&mut self.deleted_activity_ids),
            upsert_timer_infos: timer_upserts,
            delete_timer_ids: std::mem::take(&mut self.deleted_timer_ids),
            version_histories: self.version_histories.clone(),
            last_write_version: self.last_write_version,
            condition: self.condition,
            transfer_tasks: std::mem::take(&mut self.transfer_tasks),
            timer_tasks: std::mem::take(&mut self.timer_tasks),
            replication_tasks,
            cross_cluster_tasks: std::mem::take(&mut self.cross_cluster_tasks),
        };
        self.condition = self.execution_info.next_event_id;
        Ok((mutation, events))
    }

    /// Full storage view of the run, for the create path.
    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            execution_info: self.execution_info.clone(),
            activity_infos: self.activity_infos.clone(),
            timer_infos: self.timer_infos.clone(),
            child_execution_infos: self.child_execution_infos.clone(),
            signal_requested_ids: self.signal_requested_ids.clone(),
            version_histories: self.version_histories.clone(),
            last_write_version: self.last_write_version,
        }
    }

    fn validate(&self) -> EngineResult<()> {
        let info = &self.execution_info;
        if let Some(histories) = &self.version_histories {
            let current = histories.current();
            if !current.is_empty() {
                let tip = current.last_item()?;
                if tip.event_id + 1 != info.next_event_id {
                    return Err(EngineError::Invariant(format!(
                        "run {}: branch tip {} disagrees with next event id {}",
                        info.identifier(),
                        tip.event_id,
                        info.next_event_id,
                    )));
                }
            }
        }
        for activity in self.activity_infos.values() {
            if activity.schedule_id >= info.next_event_id {
                return Err(EngineError::Invariant(format!(
                    "run {}: pending activity {} at or beyond next event id {}",
                    info.identifier(),
                    activity.schedule_id,
                    info.next_event_id,
                )));
            }
        }
        let closed = info.close_status != CloseStatus::None;
        if closed != (info.state == WorkflowState::Completed) {
            return Err(EngineError::Invariant(format!(
                "run {}: state {:?} inconsistent with close status {:?}",
                info.identifier(),
                info.state,
                info.close_status,
            )));
        }
        Ok(())
    }
}

fn payload_str(payload: &Value, key: &str) -> String {
    payload[key].as_str().unwrap_or_default().to_string()
}

fn payload_i64(payload: &Value, key: &str) -> i64 {
    payload[key].as_i64().unwrap_or_default()
}

fn payload_duration(payload: &Value, key: &str) -> std::time::Duration {
    std::time::Duration::from_secs(payload[key].as_u64().unwrap_or_default())
}
