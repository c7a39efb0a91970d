//! Engine-level error taxonomy.

use meridian_persistence::PersistenceError;
use meridian_version_history::VersionHistoryError;
use uuid::Uuid;

/// Replication cannot proceed without more events; the sender must refetch
/// the hinted range and resend. Hints are half-open where present.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({domain_id}/{workflow_id}/{run_id})")]
pub struct RetryTaskError {
    pub message: &'static str,
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub start_event_id: Option<i64>,
    pub start_event_version: Option<i64>,
    pub end_event_id: Option<i64>,
    pub end_event_version: Option<i64>,
}

/// Errors surfaced by engine operations.
///
/// The engine never retries internally: transient persistence failures
/// propagate to the enclosing task processor, and nothing that could hide a
/// correctness bug is recovered locally.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    RetryTask(Box<RetryTaskError>),

    #[error(transparent)]
    VersionHistory(#[from] VersionHistoryError),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<RetryTaskError> for EngineError {
    fn from(err: RetryTaskError) -> Self {
        EngineError::RetryTask(Box::new(err))
    }
}

impl EngineError {
    /// Whether the caller should drop its cached state for the workflow.
    pub fn invalidates_cache(&self) -> bool {
        matches!(
            self,
            EngineError::Persistence(
                PersistenceError::ShardOwnershipLost { .. }
                    | PersistenceError::ConditionFailed(_)
                    | PersistenceError::CurrentWorkflowConditionFailed(_)
            )
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::Persistence(err) if err.is_not_found())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
