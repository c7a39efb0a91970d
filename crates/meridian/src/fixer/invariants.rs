//! Shipped invariant fixes.
//!
//! Each invariant inspects one scanned execution and either repairs it,
//! skips it, or reports that it could not decide. The manager aggregates a
//! pipeline of invariants into a single outcome per entity.

use meridian_persistence::{ExecutionStore, HistoryStore, WorkflowIdentifier};
use meridian_version_history::FIRST_EVENT_ID;

use crate::fixer::{
    FixManager, FixOutcome, InvariantFixResult, InvariantName, ManagerFixResult, ScanEntity,
};
use crate::shard::shard_for_workflow;

#[async_trait::async_trait]
pub trait Invariant: Send + Sync {
    fn name(&self) -> InvariantName;
    async fn fix(&self, entity: &ScanEntity) -> InvariantFixResult;
}

/// An execution whose history branch is gone is unrecoverable; delete the
/// mutable state so it stops matching and scheduling.
pub struct HistoryExistsInvariant {
    pub history_store: Box<dyn HistoryStore>,
    pub execution_store: Box<dyn ExecutionStore>,
    pub num_shards: i32,
}

#[async_trait::async_trait]
impl Invariant for HistoryExistsInvariant {
    fn name(&self) -> InvariantName {
        InvariantName::HistoryExists
    }

    async fn fix(&self, entity: &ScanEntity) -> InvariantFixResult {
        let events = self
            .history_store
            .get_history_events(&entity.branch_token, FIRST_EVENT_ID, FIRST_EVENT_ID)
            .await;
        match events {
            Ok(events) if !events.is_empty() => InvariantFixResult {
                outcome: FixOutcome::Skipped,
                invariant: Some(self.name()),
                info: None,
            },
            Ok(_) | Err(meridian_persistence::PersistenceError::NotFound(_)) => {
                let shard_id = shard_for_workflow(&entity.workflow_id, self.num_shards);
                let identifier = identifier(entity);
                match self
                    .execution_store
                    .delete_workflow_execution(shard_id, &identifier)
                    .await
                {
                    Ok(()) => InvariantFixResult {
                        outcome: FixOutcome::Fixed,
                        invariant: Some(self.name()),
                        info: Some("history did not exist".to_string()),
                    },
                    Err(err) => failed(self.name(), err),
                }
            }
            Err(err) => failed(self.name(), err),
        }
    }
}

/// History must begin with event one, a workflow start.
pub struct ValidFirstEventInvariant {
    pub history_store: Box<dyn HistoryStore>,
    pub execution_store: Box<dyn ExecutionStore>,
    pub num_shards: i32,
}

#[async_trait::async_trait]
impl Invariant for ValidFirstEventInvariant {
    fn name(&self) -> InvariantName {
        InvariantName::ValidFirstEvent
    }

    async fn fix(&self, entity: &ScanEntity) -> InvariantFixResult {
        let events = self
            .history_store
            .get_history_events(&entity.branch_token, FIRST_EVENT_ID, FIRST_EVENT_ID)
            .await;
        match events {
            Ok(events) => {
                let valid = events.first().is_some_and(|event| {
                    event.event_id == FIRST_EVENT_ID
                        && event.kind == meridian_persistence::EventKind::WorkflowStarted
                });
                if valid {
                    return InvariantFixResult {
                        outcome: FixOutcome::Skipped,
                        invariant: Some(self.name()),
                        info: None,
                    };
                }
                let shard_id = shard_for_workflow(&entity.workflow_id, self.num_shards);
                match self
                    .execution_store
                    .delete_workflow_execution(shard_id, &identifier(entity))
                    .await
                {
                    Ok(()) => InvariantFixResult {
                        outcome: FixOutcome::Fixed,
                        invariant: Some(self.name()),
                        info: Some("first event is not valid".to_string()),
                    },
                    Err(err) => failed(self.name(), err),
                }
            }
            // A missing branch belongs to HistoryExists.
            Err(meridian_persistence::PersistenceError::NotFound(_)) => InvariantFixResult {
                outcome: FixOutcome::Skipped,
                invariant: Some(self.name()),
                info: None,
            },
            Err(err) => failed(self.name(), err),
        }
    }
}

/// An open execution must be the current run for its workflow id.
pub struct OpenCurrentExecutionInvariant {
    pub execution_store: Box<dyn ExecutionStore>,
    pub num_shards: i32,
}

#[async_trait::async_trait]
impl Invariant for OpenCurrentExecutionInvariant {
    fn name(&self) -> InvariantName {
        InvariantName::OpenCurrentExecution
    }

    async fn fix(&self, entity: &ScanEntity) -> InvariantFixResult {
        let shard_id = shard_for_workflow(&entity.workflow_id, self.num_shards);
        let identifier = identifier(entity);
        let snapshot = match self
            .execution_store
            .get_workflow_execution(shard_id, &identifier)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(meridian_persistence::PersistenceError::NotFound(_)) => {
                return InvariantFixResult {
                    outcome: FixOutcome::Skipped,
                    invariant: Some(self.name()),
                    info: None,
                };
            }
            Err(err) => return failed(self.name(), err),
        };
        if !snapshot.execution_info.is_running() {
            return InvariantFixResult {
                outcome: FixOutcome::Skipped,
                invariant: Some(self.name()),
                info: None,
            };
        }
        let current = self
            .execution_store
            .get_current_run_id(shard_id, &entity.domain_id, &entity.workflow_id)
            .await;
        match current {
            Ok(run_id) if run_id == entity.run_id => InvariantFixResult {
                outcome: FixOutcome::Skipped,
                invariant: Some(self.name()),
                info: None,
            },
            Ok(_) | Err(meridian_persistence::PersistenceError::NotFound(_)) => {
                match self
                    .execution_store
                    .delete_workflow_execution(shard_id, &identifier)
                    .await
                {
                    Ok(()) => InvariantFixResult {
                        outcome: FixOutcome::Fixed,
                        invariant: Some(self.name()),
                        info: Some("execution was orphan".to_string()),
                    },
                    Err(err) => failed(self.name(), err),
                }
            }
            Err(err) => failed(self.name(), err),
        }
    }
}

/// Ordered pipeline of invariants with outcome aggregation: any failure
/// fails the entity, otherwise any fix marks it fixed, otherwise skipped.
pub struct InvariantFixManager {
    invariants: Vec<Box<dyn Invariant>>,
}

impl InvariantFixManager {
    pub fn new(invariants: Vec<Box<dyn Invariant>>) -> Self {
        Self { invariants }
    }
}

#[async_trait::async_trait]
impl FixManager for InvariantFixManager {
    async fn run_fixes(&self, entity: &ScanEntity) -> ManagerFixResult {
        let mut results = Vec::with_capacity(self.invariants.len());
        for invariant in &self.invariants {
            results.push(invariant.fix(entity).await);
        }
        let outcome = if results
            .iter()
            .any(|result| result.outcome == FixOutcome::Failed)
        {
            FixOutcome::Failed
        } else if results
            .iter()
            .any(|result| result.outcome == FixOutcome::Fixed)
        {
            FixOutcome::Fixed
        } else {
            FixOutcome::Skipped
        };
        ManagerFixResult { outcome, results }
    }
}

fn identifier(entity: &ScanEntity) -> WorkflowIdentifier {
    WorkflowIdentifier::new(
        entity.domain_id.clone(),
        entity.workflow_id.clone(),
        entity.run_id,
    )
}

fn failed(name: InvariantName, err: meridian_persistence::PersistenceError) -> InvariantFixResult {
    InvariantFixResult {
        outcome: FixOutcome::Failed,
        invariant: Some(name),
        info: Some(err.to_string()),
    }
}
