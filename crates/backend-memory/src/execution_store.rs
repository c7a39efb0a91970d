use meridian_persistence::{
    CreateWorkflowMode, CreateWorkflowRequest, PersistenceError, PersistenceResult,
    UpdateWorkflowMode, UpdateWorkflowRequest, WorkflowIdentifier, WorkflowSnapshot,
};
use uuid::Uuid;

use crate::CurrentRun;

impl crate::MemoryBackend {
    fn check_shard_fence(&self, shard_id: i32, range_id: i64) -> PersistenceResult<()> {
        let shards = self.shards.lock().expect("shards poisoned");
        let stored = shards
            .get(&shard_id)
            .ok_or_else(|| PersistenceError::NotFound(format!("shard {shard_id}")))?;
        if stored.range_id != range_id {
            return Err(PersistenceError::ShardOwnershipLost {
                shard_id,
                message: format!(
                    "write carried range id {range_id}, stored {}",
                    stored.range_id
                ),
            });
        }
        Ok(())
    }

    fn install_current(
        &self,
        shard_id: i32,
        snapshot: &WorkflowSnapshot,
    ) {
        let info = &snapshot.execution_info;
        let mut current_runs = self.current_runs.lock().expect("current runs poisoned");
        current_runs.insert(
            (shard_id, info.domain_id.clone(), info.workflow_id.clone()),
            CurrentRun {
                run_id: info.run_id,
                last_write_version: snapshot.last_write_version,
                closed: info.is_closed(),
            },
        );
    }
}

#[async_trait::async_trait]
impl meridian_persistence::ExecutionStore for crate::MemoryBackend {
    fn clone_box(&self) -> Box<dyn meridian_persistence::ExecutionStore> {
        Box::new(self.clone())
    }

    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowRequest,
    ) -> PersistenceResult<()> {
        self.check_shard_fence(request.shard_id, request.range_id)?;
        let identifier = request.snapshot.execution_info.identifier();

        {
            let executions = self.executions.lock().expect("executions poisoned");
            if executions.contains_key(&(request.shard_id, identifier.clone())) {
                return Err(PersistenceError::ConditionFailed(format!(
                    "workflow execution {identifier} already exists"
                )));
            }
        }

        let current_key = (
            request.shard_id,
            identifier.domain_id.clone(),
            identifier.workflow_id.clone(),
        );
        match &request.mode {
            CreateWorkflowMode::UpdateCurrent => {
                let current_runs = self.current_runs.lock().expect("current runs poisoned");
                if let Some(current) = current_runs.get(&current_key)
                    && !current.closed
                {
                    return Err(PersistenceError::CurrentWorkflowConditionFailed(format!(
                        "workflow {} already has open run {}",
                        identifier.workflow_id, current.run_id
                    )));
                }
                drop(current_runs);
                self.install_current(request.shard_id, &request.snapshot);
            }
            CreateWorkflowMode::BypassCurrent => {}
            CreateWorkflowMode::Replicated {
                prev_last_write_version,
            } => {
                let current_runs = self.current_runs.lock().expect("current runs poisoned");
                if let Some(current) = current_runs.get(&current_key)
                    && current.last_write_version != *prev_last_write_version
                {
                    return Err(PersistenceError::CurrentWorkflowConditionFailed(format!(
                        "current run {} has last write version {}, expected {}",
                        current.run_id, current.last_write_version, prev_last_write_version
                    )));
                }
                drop(current_runs);
                self.install_current(request.shard_id, &request.snapshot);
            }
            CreateWorkflowMode::ContinueAsNew { current_run_id } => {
                let current_runs = self.current_runs.lock().expect("current runs poisoned");
                match current_runs.get(&current_key) {
                    Some(current) if current.run_id == *current_run_id => {}
                    Some(current) => {
                        return Err(PersistenceError::CurrentWorkflowConditionFailed(format!(
                            "current run is {}, expected {current_run_id}",
                            current.run_id
                        )));
                    }
                    None => {
                        return Err(PersistenceError::CurrentWorkflowConditionFailed(format!(
                            "no current run for workflow {}",
                            identifier.workflow_id
                        )));
                    }
                }
                drop(current_runs);
                self.install_current(request.shard_id, &request.snapshot);
            }
        }

        {
            let mut executions = self.executions.lock().expect("executions poisoned");
            executions.insert((request.shard_id, identifier), request.snapshot);
        }
        self.transfer_tasks
            .lock()
            .expect("transfer tasks poisoned")
            .extend(request.transfer_tasks);
        self.timer_tasks
            .lock()
            .expect("timer tasks poisoned")
            .extend(request.timer_tasks);
        self.replication_tasks
            .lock()
            .expect("replication tasks poisoned")
            .extend(request.replication_tasks);
        Ok(())
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowRequest,
    ) -> PersistenceResult<()> {
        self.check_shard_fence(request.shard_id, request.range_id)?;
        let mutation = request.mutation;
        let identifier = mutation.execution_info.identifier();
        let current_key = (
            request.shard_id,
            identifier.domain_id.clone(),
            identifier.workflow_id.clone(),
        );

        if request.mode == UpdateWorkflowMode::BypassCurrent {
            let current_runs = self.current_runs.lock().expect("current runs poisoned");
            if let Some(current) = current_runs.get(&current_key)
                && current.run_id == identifier.run_id
            {
                return Err(PersistenceError::ConditionFailed(format!(
                    "run {} is current; bypass write refused",
                    identifier.run_id
                )));
            }
        }

        {
            let mut executions = self.executions.lock().expect("executions poisoned");
            let stored = executions
                .get_mut(&(request.shard_id, identifier.clone()))
                .ok_or_else(|| {
                    PersistenceError::NotFound(format!("workflow execution {identifier}"))
                })?;
            if stored.execution_info.next_event_id != mutation.condition {
                return Err(PersistenceError::ConditionFailed(format!(
                    "next event id is {}, write expected {}",
                    stored.execution_info.next_event_id, mutation.condition
                )));
            }
            stored.execution_info = mutation.execution_info.clone();
            for activity in &mutation.upsert_activity_infos {
                stored
                    .activity_infos
                    .insert(activity.schedule_id, activity.clone());
            }
            for schedule_id in &mutation.delete_activity_ids {
                stored.activity_infos.remove(schedule_id);
            }
            for timer in &mutation.upsert_timer_infos {
                stored.timer_infos.insert(timer.timer_id.clone(), timer.clone());
            }
            for timer_id in &mutation.delete_timer_ids {
                stored.timer_infos.remove(timer_id);
            }
            if let Some(version_histories) = &mutation.version_histories {
                stored.version_histories = Some(version_histories.clone());
            }
            stored.last_write_version = mutation.last_write_version;
        }

        if request.mode == UpdateWorkflowMode::UpdateCurrent {
            let mut current_runs = self.current_runs.lock().expect("current runs poisoned");
            current_runs.insert(
                current_key,
                CurrentRun {
                    run_id: identifier.run_id,
                    last_write_version: mutation.last_write_version,
                    closed: mutation.execution_info.is_closed(),
                },
            );
        }

        self.transfer_tasks
            .lock()
            .expect("transfer tasks poisoned")
            .extend(mutation.transfer_tasks);
        self.timer_tasks
            .lock()
            .expect("timer tasks poisoned")
            .extend(mutation.timer_tasks);
        self.replication_tasks
            .lock()
            .expect("replication tasks poisoned")
            .extend(mutation.replication_tasks);
        self.cross_cluster_tasks
            .lock()
            .expect("cross cluster tasks poisoned")
            .extend(mutation.cross_cluster_tasks);

        if let Some(new_snapshot) = request.new_snapshot {
            let new_identifier = new_snapshot.execution_info.identifier();
            self.install_current(request.shard_id, &new_snapshot);
            let mut executions = self.executions.lock().expect("executions poisoned");
            executions.insert((request.shard_id, new_identifier), new_snapshot);
        }
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        shard_id: i32,
        identifier: &WorkflowIdentifier,
    ) -> PersistenceResult<WorkflowSnapshot> {
        let executions = self.executions.lock().expect("executions poisoned");
        executions
            .get(&(shard_id, identifier.clone()))
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(format!("workflow execution {identifier}")))
    }

    async fn get_replication_tasks(
        &self,
        _shard_id: i32,
        min_task_id_exclusive: i64,
        batch_size: usize,
    ) -> PersistenceResult<Vec<meridian_persistence::ReplicationTask>> {
        let tasks = self
            .replication_tasks
            .lock()
            .expect("replication tasks poisoned");
        let mut page: Vec<meridian_persistence::ReplicationTask> = tasks
            .iter()
            .filter(|task| task.task_id > min_task_id_exclusive)
            .cloned()
            .collect();
        page.sort_by_key(|task| task.task_id);
        page.truncate(batch_size);
        Ok(page)
    }

    async fn get_current_run_id(
        &self,
        shard_id: i32,
        domain_id: &str,
        workflow_id: &str,
    ) -> PersistenceResult<Uuid> {
        let current_runs = self.current_runs.lock().expect("current runs poisoned");
        current_runs
            .get(&(shard_id, domain_id.to_string(), workflow_id.to_string()))
            .map(|current| current.run_id)
            .ok_or_else(|| {
                PersistenceError::NotFound(format!("no current run for workflow {workflow_id}"))
            })
    }

    async fn delete_workflow_execution(
        &self,
        shard_id: i32,
        identifier: &WorkflowIdentifier,
    ) -> PersistenceResult<()> {
        let mut executions = self.executions.lock().expect("executions poisoned");
        executions.remove(&(shard_id, identifier.clone()));
        let mut current_runs = self.current_runs.lock().expect("current runs poisoned");
        let current_key = (
            shard_id,
            identifier.domain_id.clone(),
            identifier.workflow_id.clone(),
        );
        if let Some(current) = current_runs.get(&current_key)
            && current.run_id == identifier.run_id
        {
            current_runs.remove(&current_key);
        }
        Ok(())
    }
}
