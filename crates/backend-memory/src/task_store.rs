use std::collections::BTreeMap;

use meridian_persistence::{
    PersistenceError, PersistenceResult, TaskInfo, TaskListInfo, TaskListKey, TaskListKind,
};

#[async_trait::async_trait]
impl meridian_persistence::TaskStore for crate::MemoryBackend {
    fn clone_box(&self) -> Box<dyn meridian_persistence::TaskStore> {
        Box::new(self.clone())
    }

    async fn lease_task_list(
        &self,
        key: &TaskListKey,
        kind: TaskListKind,
        expected_range_id: i64,
    ) -> PersistenceResult<TaskListInfo> {
        let mut task_lists = self.task_lists.lock().expect("task lists poisoned");
        let stored = task_lists.entry(key.clone()).or_insert_with(|| TaskListInfo {
            domain_id: key.domain_id.clone(),
            name: key.name.clone(),
            task_type: key.task_type,
            kind,
            range_id: 0,
            ack_level: 0,
            partition_config: None,
        });
        // Zero means the caller holds no lease and may steal the list from
        // its current owner; a stale nonzero range id must re-read first.
        if expected_range_id != 0 && stored.range_id != expected_range_id {
            return Err(PersistenceError::ConditionFailed(format!(
                "task list {} leased at range id {}, caller expected {expected_range_id}",
                key.name, stored.range_id
            )));
        }
        stored.range_id += 1;
        Ok(stored.clone())
    }

    async fn update_task_list(&self, info: TaskListInfo) -> PersistenceResult<()> {
        let mut task_lists = self.task_lists.lock().expect("task lists poisoned");
        let key = info.key();
        let stored = task_lists
            .get_mut(&key)
            .ok_or_else(|| PersistenceError::NotFound(format!("task list {}", key.name)))?;
        if stored.range_id != info.range_id {
            return Err(PersistenceError::ConditionFailed(format!(
                "task list {} leased at range id {}, write carried {}",
                key.name, stored.range_id, info.range_id
            )));
        }
        *stored = info;
        Ok(())
    }

    async fn create_tasks(
        &self,
        info: &TaskListInfo,
        tasks: Vec<TaskInfo>,
    ) -> PersistenceResult<()> {
        {
            let task_lists = self.task_lists.lock().expect("task lists poisoned");
            let key = info.key();
            let stored = task_lists
                .get(&key)
                .ok_or_else(|| PersistenceError::NotFound(format!("task list {}", key.name)))?;
            if stored.range_id != info.range_id {
                return Err(PersistenceError::ConditionFailed(format!(
                    "task list {} leased at range id {}, write carried {}",
                    key.name, stored.range_id, info.range_id
                )));
            }
        }
        let mut all_tasks = self.tasks.lock().expect("tasks poisoned");
        let queue = all_tasks.entry(info.key()).or_insert_with(BTreeMap::new);
        for task in tasks {
            queue.insert(task.task_id, task);
        }
        Ok(())
    }

    async fn get_tasks(
        &self,
        key: &TaskListKey,
        min_exclusive: i64,
        max_inclusive: i64,
        batch_size: usize,
    ) -> PersistenceResult<Vec<TaskInfo>> {
        let all_tasks = self.tasks.lock().expect("tasks poisoned");
        let Some(queue) = all_tasks.get(key) else {
            return Ok(Vec::new());
        };
        Ok(queue
            .range(min_exclusive + 1..=max_inclusive)
            .take(batch_size)
            .map(|(_, task)| task.clone())
            .collect())
    }

    async fn complete_tasks_less_than(
        &self,
        key: &TaskListKey,
        task_id: i64,
        limit: usize,
    ) -> PersistenceResult<usize> {
        let mut all_tasks = self.tasks.lock().expect("tasks poisoned");
        let Some(queue) = all_tasks.get_mut(key) else {
            return Ok(0);
        };
        let doomed: Vec<i64> = queue
            .range(..task_id)
            .take(limit)
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            queue.remove(id);
        }
        Ok(doomed.len())
    }

    async fn get_task_list_size(
        &self,
        key: &TaskListKey,
        ack_level: i64,
    ) -> PersistenceResult<i64> {
        let all_tasks = self.tasks.lock().expect("tasks poisoned");
        let Some(queue) = all_tasks.get(key) else {
            return Ok(0);
        };
        Ok(queue.range(ack_level + 1..).count() as i64)
    }
}
