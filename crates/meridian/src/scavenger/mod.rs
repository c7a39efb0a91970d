//! History scavenger: reclaims orphaned history branches.
//!
//! The archiver deletes mutable state before it uploads and deletes
//! history, so a branch whose run no longer resolves is garbage. Only
//! branches older than twice the maximum retention are touched; anything
//! younger may still be mid-archival.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use meridian_persistence::{
    split_cleanup_info, HistoryBranchRecord, HistoryBranchToken, HistoryStore, PersistenceResult,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::IntPropertyFn;
use crate::error::{EngineError, EngineResult};
use crate::ratelimit::RateLimiter;

/// One worker per this many requested ops/sec.
const RPS_PER_WORKER: usize = 50;

/// Progress snapshot reported per page so the enclosing long-running job
/// can resume mid-scan.
#[derive(Clone, Debug, Default)]
pub struct ScavengerHeartbeat {
    pub next_page_token: Option<Vec<u8>>,
    pub current_page: i32,
    pub skip_count: i32,
    pub error_count: i32,
    pub success_count: i32,
}

/// Receives per-batch progress. Supervisors persist it; tests ignore it.
pub trait ProgressReporter: Send + Sync {
    fn record_heartbeat(&self, heartbeat: &ScavengerHeartbeat);
}

pub struct NoopProgressReporter;

impl ProgressReporter for NoopProgressReporter {
    fn record_heartbeat(&self, _heartbeat: &ScavengerHeartbeat) {}
}

/// Resolves whether a run's mutable state still exists.
#[async_trait::async_trait]
pub trait MutableStateInspector: Send + Sync {
    async fn describe_mutable_state(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: Uuid,
    ) -> PersistenceResult<()>;
}

/// Inspector backed directly by the execution store.
pub struct StoreInspector {
    store: Box<dyn meridian_persistence::ExecutionStore>,
    num_shards: i32,
}

impl StoreInspector {
    pub fn new(store: Box<dyn meridian_persistence::ExecutionStore>, num_shards: i32) -> Self {
        Self { store, num_shards }
    }
}

#[async_trait::async_trait]
impl MutableStateInspector for StoreInspector {
    async fn describe_mutable_state(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: Uuid,
    ) -> PersistenceResult<()> {
        let shard_id = crate::shard::shard_for_workflow(workflow_id, self.num_shards);
        let identifier = meridian_persistence::WorkflowIdentifier::new(
            domain_id.to_string(),
            workflow_id.to_string(),
            run_id,
        );
        self.store
            .get_workflow_execution(shard_id, &identifier)
            .await
            .map(|_| ())
    }
}

#[derive(Clone, Debug)]
struct BranchTask {
    domain_id: String,
    workflow_id: String,
    run_id: Uuid,
    tree_id: Uuid,
    branch_id: Uuid,
}

pub struct Scavenger {
    history_store: Box<dyn HistoryStore>,
    inspector: Arc<dyn MutableStateInspector>,
    rps: usize,
    page_size: usize,
    max_retention_days: IntPropertyFn,
    reporter: Arc<dyn ProgressReporter>,
    heartbeat: ScavengerHeartbeat,
}

impl Scavenger {
    /// `heartbeat` carries the resume point of a previous partial run.
    pub fn new(
        history_store: Box<dyn HistoryStore>,
        inspector: Arc<dyn MutableStateInspector>,
        rps: usize,
        page_size: usize,
        max_retention_days: IntPropertyFn,
        reporter: Arc<dyn ProgressReporter>,
        heartbeat: ScavengerHeartbeat,
    ) -> Self {
        Self {
            history_store,
            inspector,
            rps,
            page_size,
            max_retention_days,
            reporter,
            heartbeat,
        }
    }

    /// One complete iteration over all history branches.
    pub async fn run(
        mut self,
        cancellation: CancellationToken,
    ) -> EngineResult<ScavengerHeartbeat> {
        let concurrency = self.rps / RPS_PER_WORKER + 1;
        let limiter = Arc::new(RateLimiter::new(self.rps));
        let (task_tx, task_rx) = tokio::sync::mpsc::channel::<BranchTask>(self.page_size);
        let (result_tx, mut result_rx) = tokio::sync::mpsc::channel::<EngineResult<()>>(self.page_size);
        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));

        let mut workers = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            workers.push(tokio::spawn(worker_loop(
                Arc::clone(&task_rx),
                result_tx.clone(),
                self.history_store.clone(),
                Arc::clone(&self.inspector),
                Arc::clone(&limiter),
                cancellation.clone(),
            )));
        }
        drop(result_tx);

        let outcome = self
            .scan_pages(&cancellation, &task_tx, &mut result_rx)
            .await;
        drop(task_tx);
        for worker in workers {
            let _ = worker.await;
        }
        outcome.map(|_| self.heartbeat)
    }

    async fn scan_pages(
        &mut self,
        cancellation: &CancellationToken,
        task_tx: &tokio::sync::mpsc::Sender<BranchTask>,
        result_rx: &mut tokio::sync::mpsc::Receiver<EngineResult<()>>,
    ) -> EngineResult<()> {
        let threshold_days = (self.max_retention_days)().max(0);
        // Doubled retention: the archiver deletes mutable state before it
        // removes history, and this scan keys off mutable-state absence.
        let threshold = ChronoDuration::days(threshold_days) * 2;

        loop {
            let page = self
                .history_store
                .get_all_history_tree_branches(
                    self.page_size,
                    self.heartbeat.next_page_token.clone(),
                )
                .await?;

            let mut batch_count = page.branches.len();
            let mut skips = 0;
            let mut split_errors = 0;
            let cutoff = chrono::Utc::now() - threshold;
            for branch in page.branches {
                if branch.fork_time > cutoff {
                    batch_count -= 1;
                    skips += 1;
                    continue;
                }
                match branch_task(&branch) {
                    Ok(task) => {
                        if task_tx.send(task).await.is_err() {
                            return Err(EngineError::Cancelled);
                        }
                    }
                    Err(err) => {
                        batch_count -= 1;
                        split_errors += 1;
                        error!(
                            tree_id = %branch.tree_id,
                            branch_id = %branch.branch_id,
                            info = %branch.info,
                            error = %err,
                            "unparsable history cleanup info"
                        );
                    }
                }
            }

            let mut success_count = 0;
            let mut error_count = 0;
            while success_count + error_count < batch_count {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => return Err(EngineError::Cancelled),
                    result = result_rx.recv() => match result {
                        Some(Ok(())) => success_count += 1,
                        Some(Err(_)) => error_count += 1,
                        None => return Err(EngineError::Cancelled),
                    },
                }
            }

            self.heartbeat.current_page += 1;
            self.heartbeat.next_page_token = page.next_page_token;
            self.heartbeat.success_count += success_count as i32;
            self.heartbeat.error_count += (error_count + split_errors) as i32;
            self.heartbeat.skip_count += skips;
            self.reporter.record_heartbeat(&self.heartbeat);

            if self.heartbeat.next_page_token.is_none() {
                return Ok(());
            }
        }
    }
}

fn branch_task(branch: &HistoryBranchRecord) -> PersistenceResult<BranchTask> {
    let (domain_id, workflow_id, run_id) = split_cleanup_info(&branch.info)?;
    Ok(BranchTask {
        domain_id,
        workflow_id,
        run_id,
        tree_id: branch.tree_id,
        branch_id: branch.branch_id,
    })
}

async fn worker_loop(
    task_rx: Arc<tokio::sync::Mutex<tokio::sync::mpsc::Receiver<BranchTask>>>,
    result_tx: tokio::sync::mpsc::Sender<EngineResult<()>>,
    history_store: Box<dyn HistoryStore>,
    inspector: Arc<dyn MutableStateInspector>,
    limiter: Arc<RateLimiter>,
    cancellation: CancellationToken,
) {
    loop {
        let task = {
            let mut receiver = task_rx.lock().await;
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => return,
                task = receiver.recv() => match task {
                    Some(task) => task,
                    None => return,
                },
            }
        };
        let result = process_branch(history_store.as_ref(), &inspector, &limiter, &cancellation, task).await;
        if result_tx.send(result).await.is_err() {
            return;
        }
    }
}

async fn process_branch(
    history_store: &dyn HistoryStore,
    inspector: &Arc<dyn MutableStateInspector>,
    limiter: &RateLimiter,
    cancellation: &CancellationToken,
    task: BranchTask,
) -> EngineResult<()> {
    limiter.acquire(cancellation).await?;

    match inspector
        .describe_mutable_state(&task.domain_id, &task.workflow_id, task.run_id)
        .await
    {
        // The run is alive; its history is not garbage.
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => {
            let token = HistoryBranchToken {
                tree_id: task.tree_id,
                branch_id: task.branch_id,
            };
            history_store
                .delete_history_branch(1, &token.encode())
                .await?;
            info!(
                domain_id = %task.domain_id,
                workflow_id = %task.workflow_id,
                run_id = %task.run_id,
                tree_id = %task.tree_id,
                branch_id = %task.branch_id,
                "deleted orphaned history branch"
            );
            Ok(())
        }
        Err(err) => {
            error!(
                workflow_id = %task.workflow_id,
                run_id = %task.run_id,
                error = %err,
                "describe mutable state failed"
            );
            Err(err.into())
        }
    }
}
