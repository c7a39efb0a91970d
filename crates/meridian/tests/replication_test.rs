//! End-to-end replication scenarios against the in-memory backend.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use meridian::cluster::ClusterMetadata;
use meridian::domain::{DomainEntry, StaticDomainResolver};
use meridian::error::EngineError;
use meridian::execution::ExecutionCache;
use meridian::replication::{
    ActivityReplicator, HistoryReplicator, ReplicateEventsRequest, SyncActivityRequest,
};
use meridian::shard::{EngineRegistry, ShardContext};
use meridian_backend_memory::{CurrentRun, MemoryBackend};
use meridian_persistence::{
    ActivityInfo, CloseStatus, EventKind, HistoryBranchToken, HistoryEvent, WorkflowExecutionInfo,
    WorkflowSnapshot, WorkflowState, EMPTY_EVENT_ID,
};
use meridian_version_history::{VersionHistories, VersionHistory, VersionHistoryItem};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const SHARD_ID: i32 = 0;

struct Harness {
    backend: MemoryBackend,
    shard: Arc<ShardContext>,
    cache: Arc<ExecutionCache>,
}

async fn harness() -> Harness {
    let backend = MemoryBackend::new();
    let mut initial = HashMap::new();
    initial.insert("east".to_string(), 0_i64);
    initial.insert("west".to_string(), 2_i64);
    let cluster = Arc::new(ClusterMetadata::new("east", 10, initial));
    let shard = Arc::new(ShardContext::new(
        SHARD_ID,
        Box::new(backend.clone()),
        Box::new(backend.clone()),
        Box::new(backend.clone()),
        cluster,
        Arc::new(EngineRegistry::new()),
    ));
    shard.acquire("host-a").await.unwrap();

    let domains = StaticDomainResolver::new();
    domains.insert(DomainEntry {
        id: "domain-1".to_string(),
        name: "orders".to_string(),
        retention: Duration::from_secs(7 * 86400),
        active_cluster: "west".to_string(),
        clusters: vec!["east".to_string(), "west".to_string()],
        failover_version: 100,
    });
    let cache = Arc::new(ExecutionCache::new(
        Arc::clone(&shard),
        Arc::new(domains),
        64 * 1024 * 1024,
    ));
    Harness {
        backend,
        shard,
        cache,
    }
}

fn history(items: &[(i64, i64)]) -> VersionHistory {
    VersionHistory::new(
        HistoryBranchToken {
            tree_id: Uuid::new_v4(),
            branch_id: Uuid::new_v4(),
        }
        .encode(),
        items
            .iter()
            .map(|(event_id, version)| VersionHistoryItem::new(*event_id, *version))
            .collect(),
    )
}

fn activity(schedule_id: i64, version: i64, attempt: i32) -> ActivityInfo {
    ActivityInfo {
        version,
        schedule_id,
        scheduled_time: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
        started_id: EMPTY_EVENT_ID,
        started_time: None,
        activity_id: format!("activity-{schedule_id}"),
        attempt,
        last_heartbeat_time: None,
        details: Vec::new(),
        schedule_to_close_timeout: Duration::from_secs(300),
        start_to_close_timeout: Duration::from_secs(30),
        heartbeat_timeout: Duration::ZERO,
        maximum_attempts: 10,
        expiration_time: None,
    }
}

fn snapshot(
    run_id: Uuid,
    state: WorkflowState,
    close_status: CloseStatus,
    histories: Option<VersionHistories>,
    activities: Vec<ActivityInfo>,
    last_write_version: i64,
) -> WorkflowSnapshot {
    let next_event_id = histories
        .as_ref()
        .and_then(|histories| histories.current().last_item().ok())
        .map(|tip| tip.event_id + 1)
        .unwrap_or(1);
    WorkflowSnapshot {
        execution_info: WorkflowExecutionInfo {
            domain_id: "domain-1".to_string(),
            workflow_id: "wf-1".to_string(),
            run_id,
            task_list: "orders".to_string(),
            workflow_type: "order-processing".to_string(),
            execution_timeout: Duration::from_secs(3600),
            task_timeout: Duration::from_secs(10),
            state,
            close_status,
            next_event_id,
            last_first_event_id: 1,
            last_event_task_id: 0,
            start_time: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
            last_updated_time: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
        },
        activity_infos: activities
            .into_iter()
            .map(|info| (info.schedule_id, info))
            .collect(),
        timer_infos: HashMap::new(),
        child_execution_infos: HashMap::new(),
        signal_requested_ids: HashSet::new(),
        version_histories: histories,
        last_write_version,
    }
}

fn sync_request(run_id: Uuid, version: i64, scheduled_id: i64) -> SyncActivityRequest {
    SyncActivityRequest {
        domain_id: "domain-1".to_string(),
        workflow_id: "wf-1".to_string(),
        run_id,
        version,
        scheduled_id,
        scheduled_time: None,
        started_id: EMPTY_EVENT_ID,
        started_time: None,
        attempt: 0,
        last_heartbeat_time: None,
        details: Vec::new(),
        version_history: None,
    }
}

fn assert_no_writes(backend: &MemoryBackend) {
    assert!(backend.timer_tasks.lock().unwrap().is_empty());
    assert!(backend.transfer_tasks.lock().unwrap().is_empty());
    assert!(backend.replication_tasks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn sync_activity_workflow_not_found_is_a_noop() {
    let h = harness().await;
    let replicator = ActivityReplicator::new(Arc::clone(&h.cache));

    let mut request = sync_request(Uuid::new_v4(), 100, 144);
    request.version_history = Some(history(&[(144, 100)]));
    replicator
        .sync_activity(&CancellationToken::new(), request)
        .await
        .unwrap();
    assert_no_writes(&h.backend);
}

#[tokio::test]
async fn sync_activity_closed_workflow_is_a_noop() {
    let h = harness().await;
    let run_id = Uuid::new_v4();
    h.backend.insert_execution(
        SHARD_ID,
        snapshot(
            run_id,
            WorkflowState::Completed,
            CloseStatus::Completed,
            Some(VersionHistories::new(history(&[(5, 100)]))),
            vec![],
            100,
        ),
    );
    let replicator = ActivityReplicator::new(Arc::clone(&h.cache));

    let mut request = sync_request(run_id, 100, 144);
    request.version_history = Some(history(&[(144, 100)]));
    replicator
        .sync_activity(&CancellationToken::new(), request)
        .await
        .unwrap();
    assert_no_writes(&h.backend);
}

#[tokio::test]
async fn sync_activity_dominated_history_is_discarded() {
    let h = harness().await;
    let run_id = Uuid::new_v4();
    h.backend.insert_execution(
        SHARD_ID,
        snapshot(
            run_id,
            WorkflowState::Running,
            CloseStatus::None,
            Some(VersionHistories::new(history(&[(1, 1), (145, 100)]))),
            vec![activity(144, 100, 0)],
            100,
        ),
    );
    let replicator = ActivityReplicator::new(Arc::clone(&h.cache));

    let mut request = sync_request(run_id, 99, 144);
    request.version_history = Some(history(&[(1, 1), (144, 99)]));
    replicator
        .sync_activity(&CancellationToken::new(), request)
        .await
        .unwrap();
    assert_no_writes(&h.backend);
}

#[tokio::test]
async fn sync_activity_ahead_on_current_branch_returns_retry() {
    let h = harness().await;
    let run_id = Uuid::new_v4();
    h.backend.insert_execution(
        SHARD_ID,
        snapshot(
            run_id,
            WorkflowState::Running,
            CloseStatus::None,
            Some(VersionHistories::new(history(&[(130, 100)]))),
            vec![],
            100,
        ),
    );
    let replicator = ActivityReplicator::new(Arc::clone(&h.cache));

    let mut request = sync_request(run_id, 100, 144);
    request.version_history = Some(history(&[(144, 100)]));
    let err = replicator
        .sync_activity(&CancellationToken::new(), request)
        .await
        .unwrap_err();
    let EngineError::RetryTask(retry) = err else {
        panic!("expected retry hint, got {err:?}");
    };
    assert_eq!(retry.start_event_id, Some(130));
    assert_eq!(retry.start_event_version, Some(100));
    assert_eq!(retry.end_event_id, None);
    assert_no_writes(&h.backend);
}

#[tokio::test]
async fn sync_activity_cross_branch_conflict_returns_retry_from_lca() {
    let h = harness().await;
    let run_id = Uuid::new_v4();
    h.backend.insert_execution(
        SHARD_ID,
        snapshot(
            run_id,
            WorkflowState::Running,
            CloseStatus::None,
            Some(VersionHistories::new(history(&[(100, 2)]))),
            vec![],
            2,
        ),
    );
    let replicator = ActivityReplicator::new(Arc::clone(&h.cache));

    let mut request = sync_request(run_id, 100, 144);
    request.version_history = Some(history(&[(50, 2), (144, 100)]));
    let err = replicator
        .sync_activity(&CancellationToken::new(), request)
        .await
        .unwrap_err();
    let EngineError::RetryTask(retry) = err else {
        panic!("expected retry hint, got {err:?}");
    };
    assert_eq!(retry.start_event_id, Some(50));
    assert_eq!(retry.start_event_version, Some(2));
}

#[tokio::test]
async fn sync_activity_heartbeat_update_is_applied_and_idempotent() {
    let h = harness().await;
    let run_id = Uuid::new_v4();
    h.backend.insert_execution(
        SHARD_ID,
        snapshot(
            run_id,
            WorkflowState::Running,
            CloseStatus::None,
            Some(VersionHistories::new(history(&[(144, 100)]))),
            vec![activity(144, 100, 0)],
            100,
        ),
    );
    h.backend.set_current_run(
        SHARD_ID,
        "domain-1",
        "wf-1",
        CurrentRun {
            run_id,
            last_write_version: 100,
            closed: false,
        },
    );
    let replicator = ActivityReplicator::new(Arc::clone(&h.cache));

    let heartbeat = Utc.timestamp_opt(1_600_000_600, 0).unwrap();
    let mut request = sync_request(run_id, 100, 144);
    request.version_history = Some(history(&[(144, 100)]));
    request.last_heartbeat_time = Some(heartbeat);
    request.details = b"progress".to_vec();
    replicator
        .sync_activity(&CancellationToken::new(), request.clone())
        .await
        .unwrap();

    let stored = h
        .backend
        .executions
        .lock()
        .unwrap()
        .values()
        .next()
        .cloned()
        .unwrap();
    let info = &stored.activity_infos[&144];
    assert_eq!(info.last_heartbeat_time, Some(heartbeat));
    assert_eq!(info.details, b"progress".to_vec());

    // The retry timer is sized from the remote heartbeat plus the
    // activity's timeout budget.
    {
        let timers = h.backend.timer_tasks.lock().unwrap();
        assert_eq!(timers.len(), 1);
        assert_eq!(
            timers[0].visibility_time,
            heartbeat + chrono::Duration::seconds(30)
        );
    }

    // Replaying the same message leaves state bitwise equal and writes
    // nothing new.
    replicator
        .sync_activity(&CancellationToken::new(), request)
        .await
        .unwrap();
    let after = h
        .backend
        .executions
        .lock()
        .unwrap()
        .values()
        .next()
        .cloned()
        .unwrap();
    assert_eq!(
        serde_json::to_vec(&stored).unwrap(),
        serde_json::to_vec(&after).unwrap()
    );
    assert_eq!(h.backend.timer_tasks.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn sync_activity_zombie_run_persists_with_bypass() {
    let h = harness().await;
    let zombie_run = Uuid::new_v4();
    let current_run = Uuid::new_v4();
    h.backend.insert_execution(
        SHARD_ID,
        snapshot(
            zombie_run,
            WorkflowState::Zombie,
            CloseStatus::None,
            Some(VersionHistories::new(history(&[(144, 100)]))),
            vec![activity(144, 100, 0)],
            100,
        ),
    );
    h.backend.set_current_run(
        SHARD_ID,
        "domain-1",
        "wf-1",
        CurrentRun {
            run_id: current_run,
            last_write_version: 200,
            closed: false,
        },
    );
    let replicator = ActivityReplicator::new(Arc::clone(&h.cache));

    let mut request = sync_request(zombie_run, 100, 144);
    request.version_history = Some(history(&[(144, 100)]));
    request.attempt = 3;
    replicator
        .sync_activity(&CancellationToken::new(), request)
        .await
        .unwrap();

    // The zombie's state advanced without touching the current pointer.
    let current = h.backend.current_runs.lock().unwrap();
    assert_eq!(
        current[&(SHARD_ID, "domain-1".to_string(), "wf-1".to_string())].run_id,
        current_run
    );
    let executions = h.backend.executions.lock().unwrap();
    let stored = executions
        .iter()
        .find(|((_, id), _)| id.run_id == zombie_run)
        .map(|(_, snapshot)| snapshot)
        .unwrap();
    assert_eq!(stored.activity_infos[&144].attempt, 3);
}

#[tokio::test]
async fn sync_activity_resurrects_pruned_activity_under_newer_version() {
    let h = harness().await;
    let run_id = Uuid::new_v4();
    // The scheduled event (144) was produced under version 100; the local
    // entry is gone, but the remote kept retrying it under era 105.
    h.backend.insert_execution(
        SHARD_ID,
        snapshot(
            run_id,
            WorkflowState::Running,
            CloseStatus::None,
            Some(VersionHistories::new(history(&[(1, 1), (145, 100), (150, 105)]))),
            vec![],
            105,
        ),
    );
    h.backend.set_current_run(
        SHARD_ID,
        "domain-1",
        "wf-1",
        CurrentRun {
            run_id,
            last_write_version: 105,
            closed: false,
        },
    );
    let replicator = ActivityReplicator::new(Arc::clone(&h.cache));

    let heartbeat = Utc.timestamp_opt(1_600_000_700, 0).unwrap();
    let mut request = sync_request(run_id, 105, 144);
    request.version_history = Some(history(&[(1, 1), (145, 100), (150, 105)]));
    request.attempt = 2;
    request.last_heartbeat_time = Some(heartbeat);
    replicator
        .sync_activity(&CancellationToken::new(), request)
        .await
        .unwrap();

    let executions = h.backend.executions.lock().unwrap();
    let stored = executions.values().next().unwrap();
    let info = &stored.activity_infos[&144];
    assert_eq!(info.version, 105);
    assert_eq!(info.attempt, 2);
    assert_eq!(info.last_heartbeat_time, Some(heartbeat));
    drop(executions);
    assert_eq!(h.backend.timer_tasks.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn sync_activity_completed_activity_stays_a_noop() {
    let h = harness().await;
    let run_id = Uuid::new_v4();
    // No pending entry and the incoming version matches the scheduled
    // event's era: the activity completed locally.
    h.backend.insert_execution(
        SHARD_ID,
        snapshot(
            run_id,
            WorkflowState::Running,
            CloseStatus::None,
            Some(VersionHistories::new(history(&[(144, 100)]))),
            vec![],
            100,
        ),
    );
    let replicator = ActivityReplicator::new(Arc::clone(&h.cache));

    let mut request = sync_request(run_id, 100, 144);
    request.version_history = Some(history(&[(144, 100)]));
    replicator
        .sync_activity(&CancellationToken::new(), request)
        .await
        .unwrap();
    assert_no_writes(&h.backend);
}

#[tokio::test]
async fn sync_activity_monotonicity_rejects_older_version_attempt() {
    let h = harness().await;
    let run_id = Uuid::new_v4();
    h.backend.insert_execution(
        SHARD_ID,
        snapshot(
            run_id,
            WorkflowState::Running,
            CloseStatus::None,
            Some(VersionHistories::new(history(&[(144, 100)]))),
            vec![activity(144, 100, 5)],
            100,
        ),
    );
    h.backend.set_current_run(
        SHARD_ID,
        "domain-1",
        "wf-1",
        CurrentRun {
            run_id,
            last_write_version: 100,
            closed: false,
        },
    );
    let replicator = ActivityReplicator::new(Arc::clone(&h.cache));

    let mut request = sync_request(run_id, 100, 144);
    request.version_history = Some(history(&[(144, 100)]));
    request.attempt = 2;
    replicator
        .sync_activity(&CancellationToken::new(), request)
        .await
        .unwrap();

    let executions = h.backend.executions.lock().unwrap();
    let stored = executions.values().next().unwrap();
    assert_eq!(stored.activity_infos[&144].attempt, 5);
    assert!(h.backend.timer_tasks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn sync_activity_legacy_path_uses_last_write_version() {
    let h = harness().await;
    let run_id = Uuid::new_v4();
    h.backend.insert_execution(
        SHARD_ID,
        snapshot(
            run_id,
            WorkflowState::Running,
            CloseStatus::None,
            None,
            vec![activity(10, 100, 0)],
            200,
        ),
    );
    let replicator = ActivityReplicator::new(Arc::clone(&h.cache));

    // Lower than the local last write version: stale, discard.
    replicator
        .sync_activity(&CancellationToken::new(), sync_request(run_id, 100, 10))
        .await
        .unwrap();
    // Higher: the events arrive via event replication; still a no-op.
    replicator
        .sync_activity(&CancellationToken::new(), sync_request(run_id, 300, 10))
        .await
        .unwrap();
    assert_no_writes(&h.backend);

    // Mixing a version history into a legacy run is refused.
    let mut mixed = sync_request(run_id, 200, 10);
    mixed.version_history = Some(history(&[(10, 200)]));
    let err = replicator
        .sync_activity(&CancellationToken::new(), mixed)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Invariant(_)));
}

// ---- event replication ---------------------------------------------------

fn event(event_id: i64, version: i64, kind: EventKind, payload: serde_json::Value) -> HistoryEvent {
    HistoryEvent {
        event_id,
        version,
        timestamp: Utc.timestamp_opt(1_600_000_000 + event_id, 0).unwrap(),
        kind,
        payload,
    }
}

fn events_request(
    run_id: Uuid,
    items: &[(i64, i64)],
    events: Vec<HistoryEvent>,
) -> ReplicateEventsRequest {
    ReplicateEventsRequest {
        domain_id: "domain-1".to_string(),
        workflow_id: "wf-1".to_string(),
        run_id,
        version_history_items: items
            .iter()
            .map(|(event_id, version)| VersionHistoryItem::new(*event_id, *version))
            .collect(),
        events,
    }
}

#[tokio::test]
async fn replicate_events_creates_missing_run() {
    let h = harness().await;
    let replicator = HistoryReplicator::new(Arc::clone(&h.cache), Arc::clone(&h.shard));
    let run_id = Uuid::new_v4();

    replicator
        .replicate_events(
            &CancellationToken::new(),
            events_request(
                run_id,
                &[(2, 102)],
                vec![
                    event(
                        1,
                        102,
                        EventKind::WorkflowStarted,
                        json!({"task_list": "orders", "workflow_type": "order-processing"}),
                    ),
                    event(
                        2,
                        102,
                        EventKind::ActivityScheduled,
                        json!({"activity_id": "charge"}),
                    ),
                ],
            ),
        )
        .await
        .unwrap();

    let executions = h.backend.executions.lock().unwrap();
    let stored = executions.values().next().unwrap();
    assert_eq!(stored.execution_info.next_event_id, 3);
    assert_eq!(stored.execution_info.state, WorkflowState::Running);
    assert!(stored.activity_infos.contains_key(&2));
    drop(executions);
    let current = h.backend.current_runs.lock().unwrap();
    assert_eq!(
        current[&(SHARD_ID, "domain-1".to_string(), "wf-1".to_string())].run_id,
        run_id
    );
}

#[tokio::test]
async fn replicate_events_appends_to_current_branch_and_is_idempotent() {
    let h = harness().await;
    let replicator = HistoryReplicator::new(Arc::clone(&h.cache), Arc::clone(&h.shard));
    let run_id = Uuid::new_v4();

    replicator
        .replicate_events(
            &CancellationToken::new(),
            events_request(
                run_id,
                &[(1, 102)],
                vec![event(
                    1,
                    102,
                    EventKind::WorkflowStarted,
                    json!({"task_list": "orders"}),
                )],
            ),
        )
        .await
        .unwrap();

    let batch = events_request(
        run_id,
        &[(3, 102)],
        vec![
            event(2, 102, EventKind::ActivityScheduled, json!({"activity_id": "a"})),
            event(3, 102, EventKind::ActivityStarted, json!({"schedule_id": 2})),
        ],
    );
    replicator
        .replicate_events(&CancellationToken::new(), batch.clone())
        .await
        .unwrap();

    let snapshot_before: WorkflowSnapshot = {
        let executions = h.backend.executions.lock().unwrap();
        executions.values().next().cloned().unwrap()
    };
    assert_eq!(snapshot_before.execution_info.next_event_id, 4);

    // Replay of an already-applied batch changes nothing.
    replicator
        .replicate_events(&CancellationToken::new(), batch)
        .await
        .unwrap();
    let snapshot_after: WorkflowSnapshot = {
        let executions = h.backend.executions.lock().unwrap();
        executions.values().next().cloned().unwrap()
    };
    assert_eq!(
        serde_json::to_vec(&snapshot_before).unwrap(),
        serde_json::to_vec(&snapshot_after).unwrap()
    );
}

#[tokio::test]
async fn replicate_events_gap_returns_retry_from_local_tip() {
    let h = harness().await;
    let replicator = HistoryReplicator::new(Arc::clone(&h.cache), Arc::clone(&h.shard));
    let run_id = Uuid::new_v4();

    replicator
        .replicate_events(
            &CancellationToken::new(),
            events_request(
                run_id,
                &[(1, 102)],
                vec![event(
                    1,
                    102,
                    EventKind::WorkflowStarted,
                    json!({"task_list": "orders"}),
                )],
            ),
        )
        .await
        .unwrap();

    let err = replicator
        .replicate_events(
            &CancellationToken::new(),
            events_request(
                run_id,
                &[(5, 102)],
                vec![event(
                    4,
                    102,
                    EventKind::SignalReceived,
                    json!({}),
                )],
            ),
        )
        .await
        .unwrap_err();
    let EngineError::RetryTask(retry) = err else {
        panic!("expected retry hint, got {err:?}");
    };
    assert_eq!(retry.start_event_id, Some(1));
    assert_eq!(retry.start_event_version, Some(102));
}

#[tokio::test]
async fn replicate_events_forks_on_higher_version_divergence() {
    let h = harness().await;
    let replicator = HistoryReplicator::new(Arc::clone(&h.cache), Arc::clone(&h.shard));
    let run_id = Uuid::new_v4();

    // Local branch: events 1..=3 under version 102 (east's era).
    replicator
        .replicate_events(
            &CancellationToken::new(),
            events_request(
                run_id,
                &[(3, 102)],
                vec![
                    event(
                        1,
                        102,
                        EventKind::WorkflowStarted,
                        json!({"task_list": "orders"}),
                    ),
                    event(2, 102, EventKind::ActivityScheduled, json!({"activity_id": "a"})),
                    event(3, 102, EventKind::ActivityScheduled, json!({"activity_id": "b"})),
                ],
            ),
        )
        .await
        .unwrap();

    // Remote diverged after event 2 under a higher failover version.
    replicator
        .replicate_events(
            &CancellationToken::new(),
            events_request(
                run_id,
                &[(2, 102), (4, 110)],
                vec![
                    event(3, 110, EventKind::TimerStarted, json!({"timer_id": "t", "timeout_seconds": 5})),
                    event(4, 110, EventKind::ActivityCompleted, json!({"schedule_id": 2})),
                ],
            ),
        )
        .await
        .unwrap();

    let executions = h.backend.executions.lock().unwrap();
    let stored = executions.values().next().unwrap();
    assert_eq!(stored.execution_info.next_event_id, 5);
    let histories = stored.version_histories.as_ref().unwrap();
    assert_eq!(histories.len(), 2);
    let tip = histories.current().last_item().unwrap();
    assert_eq!(tip, VersionHistoryItem::new(4, 110));
    // The rebuilt state reflects the winning branch: activity 2 completed
    // there, activity 3 (local-only divergent event) gone, timer present.
    assert!(!stored.activity_infos.contains_key(&2));
    assert!(!stored.activity_infos.contains_key(&3));
    assert!(stored.timer_infos.contains_key("t"));
}

#[tokio::test]
async fn active_updates_feed_the_replication_queue() {
    let h = harness().await;
    let run_id = Uuid::new_v4();
    let identifier = meridian_persistence::WorkflowIdentifier::new("domain-1", "wf-1", run_id);
    let context = h.cache.get_or_create(&identifier);
    let cancellation = CancellationToken::new();

    {
        let mut handle = context.lock(&cancellation).await.unwrap();
        let mut state = meridian::MutableState::start(
            "domain-1",
            "wf-1",
            run_id,
            "orders",
            "order-processing",
            Duration::from_secs(3600),
            Duration::from_secs(10),
            100,
            true,
            Utc::now(),
        );
        state
            .apply_events(
                vec![meridian::execution::NewEvent {
                    kind: EventKind::WorkflowStarted,
                    payload: json!({}),
                }],
                Utc::now(),
            )
            .unwrap();
        handle
            .create_workflow(
                state,
                meridian_persistence::CreateWorkflowMode::UpdateCurrent,
                meridian::execution::TransactionPolicy::Active,
                Utc::now(),
            )
            .await
            .unwrap();

        let state = handle.load().await.unwrap();
        state
            .apply_events(
                vec![meridian::execution::NewEvent {
                    kind: EventKind::ActivityScheduled,
                    payload: json!({"activity_id": "charge", "start_to_close_seconds": 30}),
                }],
                Utc::now(),
            )
            .unwrap();
        handle.update_as_active(Utc::now()).await.unwrap();
    }

    // The peer polls this shard's queue; the ack position persists under
    // the fence.
    let messages = h
        .shard
        .get_replication_messages("west", 0, 10)
        .await
        .unwrap();
    assert!(!messages.is_empty());
    let last_id = messages.last().unwrap().task_id;
    let drained = h
        .shard
        .get_replication_messages("west", last_id, 10)
        .await
        .unwrap();
    assert!(drained.is_empty());
    assert_eq!(
        h.shard.shard_info().cluster_replication_level.get("west"),
        Some(&last_id)
    );

    let remote_time = Utc.timestamp_opt(1_600_000_999, 0).unwrap();
    h.shard.sync_shard_status("west", remote_time).await.unwrap();
    assert_eq!(
        h.shard.shard_info().cluster_timer_ack_level.get("west"),
        Some(&remote_time)
    );
}

#[tokio::test]
async fn replicate_events_dominated_batch_is_discarded() {
    let h = harness().await;
    let replicator = HistoryReplicator::new(Arc::clone(&h.cache), Arc::clone(&h.shard));
    let run_id = Uuid::new_v4();

    replicator
        .replicate_events(
            &CancellationToken::new(),
            events_request(
                run_id,
                &[(2, 102), (3, 112)],
                vec![
                    event(
                        1,
                        102,
                        EventKind::WorkflowStarted,
                        json!({"task_list": "orders"}),
                    ),
                    event(2, 102, EventKind::ActivityScheduled, json!({"activity_id": "a"})),
                    event(3, 112, EventKind::SignalReceived, json!({})),
                ],
            ),
        )
        .await
        .unwrap();

    // A stale branch from the older era diverging below the tip loses.
    replicator
        .replicate_events(
            &CancellationToken::new(),
            events_request(
                run_id,
                &[(2, 102), (4, 110)],
                vec![
                    event(3, 110, EventKind::SignalReceived, json!({})),
                    event(4, 110, EventKind::SignalReceived, json!({})),
                ],
            ),
        )
        .await
        .unwrap();

    let executions = h.backend.executions.lock().unwrap();
    let stored = executions.values().next().unwrap();
    let tip = stored
        .version_histories
        .as_ref()
        .unwrap()
        .current()
        .last_item()
        .unwrap();
    assert_eq!(tip, VersionHistoryItem::new(3, 112));
}
