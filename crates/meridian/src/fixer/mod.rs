//! Shard fixer: replays a scanner's findings through a pipeline of
//! invariant fixes.
//!
//! Control flow is deliberately unforgiving: any iterator read error,
//! writer add error, or flush error stops the shard and returns the report
//! with the failure recorded and whatever per-domain statistics
//! accumulated so far. There are no retries; the caller re-runs the shard.

mod invariants;

use std::collections::HashMap;

pub use invariants::{
    HistoryExistsInvariant, Invariant, InvariantFixManager, OpenCurrentExecutionInvariant,
    ValidFirstEventInvariant,
};

use meridian_persistence::WorkflowState;
use tracing::warn;
use uuid::Uuid;

use crate::config::DomainBoolPropertyFn;
use crate::domain::DomainResolver;

/// Aggregated outcome of running the fix pipeline over one entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixOutcome {
    Fixed,
    Skipped,
    Failed,
}

/// Names of the shipped invariants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvariantName {
    HistoryExists,
    ValidFirstEvent,
    OpenCurrentExecution,
}

/// Result of one invariant's fix attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvariantFixResult {
    pub outcome: FixOutcome,
    pub invariant: Option<InvariantName>,
    pub info: Option<String>,
}

/// Result of the whole pipeline for one entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerFixResult {
    pub outcome: FixOutcome,
    pub results: Vec<InvariantFixResult>,
}

impl ManagerFixResult {
    pub fn skipped() -> Self {
        Self {
            outcome: FixOutcome::Skipped,
            results: Vec::new(),
        }
    }
}

/// One concrete execution as emitted by the upstream scanner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanEntity {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub state: Option<WorkflowState>,
    pub branch_token: Vec<u8>,
}

/// One record of the scanner's output stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanRecord {
    pub execution: ScanEntity,
}

/// A fixed/skipped/failed row routed to the matching output stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FixOutputRecord {
    pub execution: ScanEntity,
    pub input: ScanRecord,
    pub result: ManagerFixResult,
}

/// Blob-store keys of a flushed output stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreKeys {
    pub uuid: String,
}

/// Scanner output iterator. `None` ends the stream; an `Err` item is a
/// control-flow failure.
pub trait ScanOutputIterator: Send {
    fn next(&mut self) -> Option<Result<ScanRecord, String>>;
}

/// Buffered writer for one output stream.
#[async_trait::async_trait]
pub trait FixResultWriter: Send {
    async fn add(&mut self, record: FixOutputRecord) -> Result<(), String>;
    async fn flush(&mut self) -> Result<(), String>;
    fn flushed_keys(&self) -> Option<StoreKeys>;
}

/// Runs the invariant pipeline over one entity.
#[async_trait::async_trait]
pub trait FixManager: Send + Sync {
    async fn run_fixes(&self, entity: &ScanEntity) -> ManagerFixResult;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FixStats {
    pub entities_count: i64,
    pub fixed_count: i64,
    pub skipped_count: i64,
    pub failed_count: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControlFlowFailure {
    pub info: String,
    pub info_details: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FixKeys {
    pub fixed: Option<StoreKeys>,
    pub skipped: Option<StoreKeys>,
    pub failed: Option<StoreKeys>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FixResult {
    pub control_flow_failure: Option<ControlFlowFailure>,
    pub shard_fix_keys: Option<FixKeys>,
}

/// Everything one shard run produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FixReport {
    pub shard_id: i32,
    pub stats: FixStats,
    pub result: FixResult,
    pub domain_stats: HashMap<String, FixStats>,
}

pub struct ShardFixer<I, W, M> {
    pub shard_id: i32,
    pub iterator: I,
    pub manager: M,
    pub fixed_writer: W,
    pub skipped_writer: W,
    pub failed_writer: W,
    pub domains: std::sync::Arc<dyn DomainResolver>,
    pub allow_domain: DomainBoolPropertyFn,
    pub progress_report: Box<dyn Fn() + Send>,
}

impl<I, W, M> ShardFixer<I, W, M>
where
    I: ScanOutputIterator,
    W: FixResultWriter,
    M: FixManager,
{
    /// Drain the scan stream and produce the shard's report.
    pub async fn fix(mut self) -> FixReport {
        let mut stats = FixStats::default();
        let mut domain_stats: HashMap<String, FixStats> = HashMap::new();

        while let Some(item) = self.iterator.next() {
            (self.progress_report)();
            let record = match item {
                Ok(record) => record,
                Err(details) => {
                    return report(
                        self.shard_id,
                        stats,
                        domain_stats,
                        failure("blobstore iterator returned error", details),
                    );
                }
            };
            let entity = record.execution.clone();
            let domain_id = entity.domain_id.clone();
            stats.entities_count += 1;
            let per_domain = domain_stats.entry(domain_id.clone()).or_default();
            per_domain.entities_count += 1;

            let domain_name = match self.domains.domain_name(&domain_id) {
                Some(name) => name,
                None => {
                    warn!(domain_id = %domain_id, "domain not resolvable; skipping entity");
                    stats.skipped_count += 1;
                    per_domain.skipped_count += 1;
                    continue;
                }
            };

            let result = if (self.allow_domain)(&domain_name) {
                self.manager.run_fixes(&entity).await
            } else {
                ManagerFixResult::skipped()
            };
            let outcome = result.outcome;
            let output = FixOutputRecord {
                execution: entity,
                input: record,
                result,
            };
            let write = match outcome {
                FixOutcome::Fixed => self.fixed_writer.add(output).await.map_err(|details| {
                    failure("blobstore add failed for fixed execution fix", details)
                }),
                FixOutcome::Skipped => self.skipped_writer.add(output).await.map_err(|details| {
                    failure("blobstore add failed for skipped execution fix", details)
                }),
                FixOutcome::Failed => self.failed_writer.add(output).await.map_err(|details| {
                    failure("blobstore add failed for failed execution fix", details)
                }),
            };
            if let Err(control_flow_failure) = write {
                return report(self.shard_id, stats, domain_stats, control_flow_failure);
            }
            let per_domain = domain_stats.entry(domain_id).or_default();
            match outcome {
                FixOutcome::Fixed => {
                    stats.fixed_count += 1;
                    per_domain.fixed_count += 1;
                }
                FixOutcome::Skipped => {
                    stats.skipped_count += 1;
                    per_domain.skipped_count += 1;
                }
                FixOutcome::Failed => {
                    stats.failed_count += 1;
                    per_domain.failed_count += 1;
                }
            }
        }

        if let Err(details) = self.fixed_writer.flush().await {
            return report(
                self.shard_id,
                stats,
                domain_stats,
                failure("failed to flush for fixed execution fixes", details),
            );
        }
        if let Err(details) = self.skipped_writer.flush().await {
            return report(
                self.shard_id,
                stats,
                domain_stats,
                failure("failed to flush for skipped execution fixes", details),
            );
        }
        if let Err(details) = self.failed_writer.flush().await {
            return report(
                self.shard_id,
                stats,
                domain_stats,
                failure("failed to flush for failed execution fixes", details),
            );
        }

        FixReport {
            shard_id: self.shard_id,
            stats,
            result: FixResult {
                control_flow_failure: None,
                shard_fix_keys: Some(FixKeys {
                    fixed: self.fixed_writer.flushed_keys(),
                    skipped: self.skipped_writer.flushed_keys(),
                    failed: self.failed_writer.flushed_keys(),
                }),
            },
            domain_stats,
        }
    }
}

fn failure(info: &str, details: String) -> ControlFlowFailure {
    ControlFlowFailure {
        info: info.to_string(),
        info_details: details,
    }
}

fn report(
    shard_id: i32,
    stats: FixStats,
    domain_stats: HashMap<String, FixStats>,
    control_flow_failure: ControlFlowFailure,
) -> FixReport {
    FixReport {
        shard_id,
        stats,
        result: FixResult {
            control_flow_failure: Some(control_flow_failure),
            shard_fix_keys: None,
        },
        domain_stats,
    }
}
