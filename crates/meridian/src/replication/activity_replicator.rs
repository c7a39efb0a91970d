//! Passive application of remote activity progress.
//!
//! The decision procedure is deliberately strict: `(version, attempt)` is
//! the only causality comparator, version histories arbitrate which branch
//! is ahead, and anything the local cluster cannot apply yet comes back as
//! a retry hint naming the event range to resend. Stale updates degrade to
//! idempotent no-ops, never errors.

use std::sync::Arc;

use chrono::Utc;
use meridian_persistence::{ActivityInfo, UpdateWorkflowMode, WorkflowState};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{EngineError, EngineResult, RetryTaskError};
use crate::execution::{ExecutionCache, MutableState};
use crate::replication::messages::SyncActivityRequest;
use crate::replication::{RESEND_HIGHER_VERSION, RESEND_MISSING_EVENTS};

pub struct ActivityReplicator {
    cache: Arc<ExecutionCache>,
}

impl ActivityReplicator {
    pub fn new(cache: Arc<ExecutionCache>) -> Self {
        Self { cache }
    }

    /// Apply one remote activity snapshot. Success means the local cluster
    /// is at least as current as the sender for this activity.
    pub async fn sync_activity(
        &self,
        cancellation: &CancellationToken,
        request: SyncActivityRequest,
    ) -> EngineResult<()> {
        let identifier = request.identifier();
        let context = self.cache.get_or_create(&identifier);
        let mut handle = context.lock(cancellation).await?;

        let state = match handle.load().await {
            Ok(state) => state,
            // Retention already deleted the run; the sync is moot.
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        if !state.is_running() {
            return Ok(());
        }

        if !should_apply(state, &request)? {
            debug!(identifier = %identifier, scheduled_id = request.scheduled_id,
                "discarding stale activity sync");
            return Ok(());
        }

        let resurrect = match state.get_activity_info(request.scheduled_id) {
            Some(local) => {
                if !accepts_update(local, &request) {
                    return Ok(());
                }
                false
            }
            None => {
                if !should_resurrect(state, &request) {
                    // Completed locally; the remote snapshot is history.
                    return Ok(());
                }
                true
            }
        };
        state.replicate_activity_info(&request, resurrect)?;
        if let Some(timer) = state.next_activity_retry_timer(request.scheduled_id) {
            state.add_timer_task(timer);
        }

        let mode = if state.state() == WorkflowState::Zombie {
            UpdateWorkflowMode::BypassCurrent
        } else {
            UpdateWorkflowMode::UpdateCurrent
        };
        let now = request.last_heartbeat_time.unwrap_or_else(Utc::now);
        handle.update_as_passive(now, mode).await
    }
}

/// Whether the sync may touch local state, or how the sender must catch us
/// up first.
fn should_apply(state: &MutableState, request: &SyncActivityRequest) -> EngineResult<bool> {
    let retry = |message: &'static str, start: meridian_version_history::VersionHistoryItem| {
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

    match state.version_histories() {
        Some(histories) => {
            let incoming = request.version_history.as_ref().ok_or_else(|| {
                EngineError::Invariant(
                    "activity sync without version history against a versioned run".to_string(),
                )
            })?;
            let current = histories.current();
            let lca = current.lca(incoming)?;
            let incoming_tip = incoming.last_item()?;
            let local_tip = current.last_item()?;

            // Incoming is a subset of our branch: the scheduled event is
            // already local, go compare the activity itself.
            if incoming_tip == lca {
                return Ok(true);
            }

            if lca == local_tip {
                // Incoming strictly extends our branch. Fine as long as the
                // activity's scheduled event is not among the events we
                // have not seen yet.
                if request.scheduled_id > local_tip.event_id {
                    return Err(retry(RESEND_MISSING_EVENTS, local_tip));
                }
                return Ok(true);
            }

            // True divergence below our tip.
            if incoming_tip.version > local_tip.version {
                return Err(retry(RESEND_HIGHER_VERSION, lca));
            }
            Ok(false)
        }
        None => {
            // Legacy two-cluster protocol: no version histories, causality
            // rides on the last write version alone. Mixing is refused.
            if request.version_history.is_some() {
                return Err(EngineError::Invariant(
                    "versioned activity sync against a legacy run".to_string(),
                ));
            }
            let last_write_version = state.last_write_version();
            if request.version < last_write_version {
                return Ok(false);
            }
            if request.version > last_write_version {
                // The events carrying the newer version arrive through
                // event replication; nothing to do here.
                return Ok(false);
            }
            Ok(true)
        }
    }
}

/// Whether a sync for a pruned activity entry recreates it. The entry is
/// rebuilt only when the remote progressed the activity under a failover
/// version newer than the era that produced its scheduled event locally;
/// an equal version means the activity genuinely completed here.
fn should_resurrect(state: &MutableState, request: &SyncActivityRequest) -> bool {
    let Some(histories) = state.version_histories() else {
        return false;
    };
    match histories.current().version_for_event(request.scheduled_id) {
        Some(scheduled_version) => request.version > scheduled_version,
        None => false,
    }
}

/// `(version, attempt)` lexicographic comparison; heartbeat progress breaks
/// exact ties.
fn accepts_update(local: &ActivityInfo, request: &SyncActivityRequest) -> bool {
    if request.version != local.version {
        return request.version > local.version;
    }
    if request.attempt != local.attempt {
        return request.attempt > local.attempt;
    }
    match (local.last_heartbeat_time, request.last_heartbeat_time) {
        (Some(local_heartbeat), Some(incoming_heartbeat)) => incoming_heartbeat > local_heartbeat,
        (Some(_), None) => false,
        (None, Some(_)) => true,
        (None, None) => false,
    }
}
