// The models here are the storage-facing view of a workflow run. Concrete
// drivers convert internally; the engine never sees driver rows.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use meridian_version_history::VersionHistories;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PersistenceError, PersistenceResult};

/// Key of a single workflow run.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowIdentifier {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: Uuid,
}

impl WorkflowIdentifier {
    pub fn new(
        domain_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: Uuid,
    ) -> Self {
        Self {
            domain_id: domain_id.into(),
            workflow_id: workflow_id.into(),
            run_id,
        }
    }
}

impl std::fmt::Display for WorkflowIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.domain_id, self.workflow_id, self.run_id
        )
    }
}

/// Lifecycle state of a run. A `Zombie` exists for replication purposes but
/// is not the current run for its workflow id; the persistence write mode is
/// derived from this tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Created,
    Running,
    Zombie,
    Completed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseStatus {
    #[default]
    None,
    Completed,
    Failed,
    Canceled,
    Terminated,
    ContinuedAsNew,
    TimedOut,
}

/// Condensed, queryable view of a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowExecutionInfo {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub task_list: String,
    pub workflow_type: String,
    pub execution_timeout: Duration,
    pub task_timeout: Duration,
    pub state: WorkflowState,
    pub close_status: CloseStatus,
    pub next_event_id: i64,
    pub last_first_event_id: i64,
    pub last_event_task_id: i64,
    pub start_time: DateTime<Utc>,
    pub last_updated_time: DateTime<Utc>,
}

impl WorkflowExecutionInfo {
    pub fn identifier(&self) -> WorkflowIdentifier {
        WorkflowIdentifier::new(
            self.domain_id.clone(),
            self.workflow_id.clone(),
            self.run_id,
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, WorkflowState::Created | WorkflowState::Running)
    }

    pub fn is_closed(&self) -> bool {
        self.close_status != CloseStatus::None
    }
}

/// Progress snapshot of one scheduled activity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub version: i64,
    pub schedule_id: i64,
    pub scheduled_time: DateTime<Utc>,
    pub started_id: i64,
    pub started_time: Option<DateTime<Utc>>,
    pub activity_id: String,
    pub attempt: i32,
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    pub details: Vec<u8>,
    pub schedule_to_close_timeout: Duration,
    pub start_to_close_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub maximum_attempts: i32,
    pub expiration_time: Option<DateTime<Utc>>,
}

/// Id not yet assigned to a started event.
pub const EMPTY_EVENT_ID: i64 = -23;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimerInfo {
    pub timer_id: String,
    pub version: i64,
    pub started_id: i64,
    pub expiry_time: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChildExecutionInfo {
    pub version: i64,
    pub initiated_id: i64,
    pub started_id: i64,
    pub workflow_id: String,
    pub run_id: Option<Uuid>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowTimedOut,
    WorkflowTerminated,
    WorkflowCanceled,
    WorkflowContinuedAsNew,
    DecisionScheduled,
    DecisionStarted,
    DecisionCompleted,
    ActivityScheduled,
    ActivityStarted,
    ActivityCompleted,
    ActivityFailed,
    ActivityTimedOut,
    TimerStarted,
    TimerFired,
    TimerCanceled,
    SignalReceived,
}

impl EventKind {
    /// Whether this kind closes the run, and with which status.
    pub fn close_status(&self) -> Option<CloseStatus> {
        match self {
            EventKind::WorkflowCompleted => Some(CloseStatus::Completed),
            EventKind::WorkflowFailed => Some(CloseStatus::Failed),
            EventKind::WorkflowTimedOut => Some(CloseStatus::TimedOut),
            EventKind::WorkflowTerminated => Some(CloseStatus::Terminated),
            EventKind::WorkflowCanceled => Some(CloseStatus::Canceled),
            EventKind::WorkflowContinuedAsNew => Some(CloseStatus::ContinuedAsNew),
            _ => None,
        }
    }
}

/// One entry of a run's append-only history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

/// Work handed to external subsystems (matching, child starts, closes).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferTask {
    pub task_id: i64,
    pub identifier: WorkflowIdentifier,
    pub version: i64,
    pub kind: TransferTaskKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferTaskKind {
    ActivityTask { task_list: String, schedule_id: i64 },
    DecisionTask { task_list: String, schedule_id: i64 },
    CloseExecution,
    DeleteExecution,
}

/// Deadline-driven work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimerTask {
    pub task_id: i64,
    pub visibility_time: DateTime<Utc>,
    pub identifier: WorkflowIdentifier,
    pub version: i64,
    pub kind: TimerTaskKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerTaskKind {
    ActivityRetryTimer { schedule_id: i64, attempt: i32 },
    ActivityTimeout { schedule_id: i64 },
    UserTimer { timer_id: String },
    WorkflowTimeout,
    DeleteHistory,
}

/// Outbound events to peer clusters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub task_id: i64,
    pub identifier: WorkflowIdentifier,
    pub kind: ReplicationTaskKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationTaskKind {
    History {
        first_event_id: i64,
        next_event_id: i64,
        version: i64,
        branch_token: Vec<u8>,
    },
    SyncActivity {
        schedule_id: i64,
        version: i64,
    },
}

/// Inter-region RPC work targeted at one peer cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrossClusterTask {
    pub task_id: i64,
    pub target_cluster: String,
    pub identifier: WorkflowIdentifier,
    pub version: i64,
    pub kind: TransferTaskKind,
}

/// Shard ownership record. Every write to shard-owned data is conditioned
/// on `range_id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardInfo {
    pub shard_id: i32,
    pub range_id: i64,
    pub owner: String,
    pub transfer_ack_level: i64,
    pub timer_ack_level: DateTime<Utc>,
    pub cluster_replication_level: HashMap<String, i64>,
    pub cluster_timer_ack_level: HashMap<String, DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ShardInfo {
    pub fn new(shard_id: i32) -> Self {
        Self {
            shard_id,
            range_id: 0,
            owner: String::new(),
            transfer_ack_level: 0,
            timer_ack_level: DateTime::<Utc>::MIN_UTC,
            cluster_replication_level: HashMap::new(),
            cluster_timer_ack_level: HashMap::new(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskListType {
    Decision,
    Activity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskListKind {
    Normal,
    Sticky,
}

/// Key of one task list queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskListKey {
    pub domain_id: String,
    pub name: String,
    pub task_type: TaskListType,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskListInfo {
    pub domain_id: String,
    pub name: String,
    pub task_type: TaskListType,
    pub kind: TaskListKind,
    pub range_id: i64,
    pub ack_level: i64,
    pub partition_config: Option<TaskListPartitionConfig>,
}

impl TaskListInfo {
    pub fn key(&self) -> TaskListKey {
        TaskListKey {
            domain_id: self.domain_id.clone(),
            name: self.name.clone(),
            task_type: self.task_type,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskListPartitionConfig {
    pub version: i64,
    pub num_read_partitions: i32,
    pub num_write_partitions: i32,
}

/// One matchable task appended to a task list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: i64,
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub schedule_id: i64,
    pub created_time: DateTime<Utc>,
    pub expiry: Option<DateTime<Utc>>,
}

/// One branch row of the history tree, as listed by the scavenger scan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryBranchRecord {
    pub tree_id: Uuid,
    pub branch_id: Uuid,
    pub fork_time: DateTime<Utc>,
    /// Encoded cleanup coordinates, see [`encode_cleanup_info`].
    pub info: String,
}

#[derive(Clone, Debug, Default)]
pub struct HistoryBranchPage {
    pub branches: Vec<HistoryBranchRecord>,
    pub next_page_token: Option<Vec<u8>>,
}

/// Opaque branch token content. Drivers may store this however they like;
/// the engine treats the bytes as opaque.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryBranchToken {
    pub tree_id: Uuid,
    pub branch_id: Uuid,
}

impl HistoryBranchToken {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("branch token serializes")
    }

    pub fn decode(bytes: &[u8]) -> PersistenceResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| PersistenceError::NotFound(format!("bad branch token: {err}")))
    }
}

/// Encode `(domain_id, workflow_id, run_id)` into a branch's cleanup info.
pub fn encode_cleanup_info(domain_id: &str, workflow_id: &str, run_id: Uuid) -> String {
    format!("{domain_id}:{workflow_id}:{run_id}")
}

/// Split a branch's cleanup info back into its coordinates.
pub fn split_cleanup_info(info: &str) -> PersistenceResult<(String, String, Uuid)> {
    let mut parts = info.splitn(3, ':');
    let (Some(domain_id), Some(workflow_id), Some(run_id)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(PersistenceError::NotFound(format!(
            "malformed history cleanup info: {info}"
        )));
    };
    let run_id = Uuid::parse_str(run_id).map_err(|err| {
        PersistenceError::NotFound(format!("malformed run id in cleanup info: {err}"))
    })?;
    Ok((domain_id.to_string(), workflow_id.to_string(), run_id))
}

/// Full read model of a run as loaded from storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub execution_info: WorkflowExecutionInfo,
    pub activity_infos: HashMap<i64, ActivityInfo>,
    pub timer_infos: HashMap<String, TimerInfo>,
    pub child_execution_infos: HashMap<i64, ChildExecutionInfo>,
    pub signal_requested_ids: HashSet<Uuid>,
    pub version_histories: Option<VersionHistories>,
    pub last_write_version: i64,
}

/// Delta produced by closing a workflow transaction. History events are
/// appended through the history store before this write lands.
#[derive(Clone, Debug)]
pub struct WorkflowMutation {
    pub execution_info: WorkflowExecutionInfo,
    pub upsert_activity_infos: Vec<ActivityInfo>,
    pub delete_activity_ids: Vec<i64>,
    pub upsert_timer_infos: Vec<TimerInfo>,
    pub delete_timer_ids: Vec<String>,
    pub version_histories: Option<VersionHistories>,
    pub last_write_version: i64,
    /// Expected `next_event_id` currently stored; the write fails when the
    /// stored value differs.
    pub condition: i64,
    pub transfer_tasks: Vec<TransferTask>,
    pub timer_tasks: Vec<TimerTask>,
    pub replication_tasks: Vec<ReplicationTask>,
    pub cross_cluster_tasks: Vec<CrossClusterTask>,
}

/// How a create interacts with the current-run pointer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreateWorkflowMode {
    /// Brand-new workflow id; insert the current-run pointer.
    UpdateCurrent,
    /// Replicated zombie run; leave the current-run pointer alone.
    BypassCurrent,
    /// Passive creation of a run that becomes current, conditioned on the
    /// previous run's last write version.
    Replicated { prev_last_write_version: i64 },
    /// The previous run continued as new into this one.
    ContinueAsNew { current_run_id: Uuid },
}

/// How an update interacts with the current-run pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateWorkflowMode {
    UpdateCurrent,
    BypassCurrent,
}

#[derive(Clone, Debug)]
pub struct CreateWorkflowRequest {
    pub shard_id: i32,
    pub range_id: i64,
    pub mode: CreateWorkflowMode,
    pub snapshot: WorkflowSnapshot,
    pub transfer_tasks: Vec<TransferTask>,
    pub timer_tasks: Vec<TimerTask>,
    pub replication_tasks: Vec<ReplicationTask>,
}

#[derive(Clone, Debug)]
pub struct UpdateWorkflowRequest {
    pub shard_id: i32,
    pub range_id: i64,
    pub mode: UpdateWorkflowMode,
    pub mutation: WorkflowMutation,
    /// Present when the run continues as new in the same transaction.
    pub new_snapshot: Option<WorkflowSnapshot>,
}
