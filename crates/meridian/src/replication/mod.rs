//! Passive replication: applying a peer cluster's events and activity
//! progress under version-history rules.

mod activity_replicator;
mod history_replicator;
mod messages;

pub use activity_replicator::ActivityReplicator;
pub use history_replicator::HistoryReplicator;
pub use messages::{ReplicateEventsRequest, SyncActivityRequest};

pub(crate) const RESEND_HIGHER_VERSION: &str =
    "retry replication: a branch with a higher version exists on the remote cluster";
pub(crate) const RESEND_MISSING_EVENTS: &str = "retry replication: resend missing events";
