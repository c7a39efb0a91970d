//! The common persistence error envelope.

/// Errors surfaced by the persistence contract.
///
/// `ShardOwnershipLost` and the two condition failures are terminal for the
/// current operation; `Retriable` is safe to re-enqueue at the task-processor
/// level. Nothing below this layer retries.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// A conditional write carried a stale range id. The caller no longer
    /// owns the shard and must drop its in-memory state.
    #[error("shard {shard_id} ownership lost: {message}")]
    ShardOwnershipLost { shard_id: i32, message: String },

    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional write on an execution's expected state vector failed.
    #[error("condition failed: {0}")]
    ConditionFailed(String),

    /// The current-run pointer for a workflow id did not match expectations.
    #[error("current workflow condition failed: {0}")]
    CurrentWorkflowConditionFailed(String),

    /// The operation observed cancellation and stopped early.
    #[error("operation cancelled")]
    Cancelled,

    /// Transient storage failure; the enclosing task processor may retry.
    #[error("transient persistence failure: {0}")]
    Retriable(String),
}

impl PersistenceError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, PersistenceError::Retriable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PersistenceError::NotFound(_))
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;
