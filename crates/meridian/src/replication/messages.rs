//! Wire-facing replication payloads. The RPC transport lives outside the
//! engine; these are the decoded shapes it hands over.

use chrono::{DateTime, Utc};
use meridian_persistence::{HistoryEvent, WorkflowIdentifier};
use meridian_version_history::{VersionHistory, VersionHistoryItem};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A remote activity heartbeat or state change.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncActivityRequest {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub version: i64,
    pub scheduled_id: i64,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub started_id: i64,
    pub started_time: Option<DateTime<Utc>>,
    pub attempt: i32,
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    pub details: Vec<u8>,
    /// Absent on domains still running the legacy two-cluster protocol.
    pub version_history: Option<VersionHistory>,
}

impl SyncActivityRequest {
    pub fn identifier(&self) -> WorkflowIdentifier {
        WorkflowIdentifier::new(self.domain_id.clone(), self.workflow_id.clone(), self.run_id)
    }
}

/// A batch of remote events with the sender's view of the branch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicateEventsRequest {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub version_history_items: Vec<VersionHistoryItem>,
    pub events: Vec<HistoryEvent>,
}

impl ReplicateEventsRequest {
    pub fn identifier(&self) -> WorkflowIdentifier {
        WorkflowIdentifier::new(self.domain_id.clone(), self.workflow_id.clone(), self.run_id)
    }
}
