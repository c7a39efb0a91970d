use chrono::Utc;
use meridian_persistence::{
    HistoryBranchPage, HistoryBranchRecord, HistoryBranchToken, HistoryEvent, PersistenceError,
    PersistenceResult,
};

fn decode_page_token(token: Option<Vec<u8>>) -> PersistenceResult<usize> {
    match token {
        None => Ok(0),
        Some(bytes) => serde_json::from_slice(&bytes)
            .map_err(|err| PersistenceError::NotFound(format!("bad page token: {err}"))),
    }
}

#[async_trait::async_trait]
impl meridian_persistence::HistoryStore for crate::MemoryBackend {
    fn clone_box(&self) -> Box<dyn meridian_persistence::HistoryStore> {
        Box::new(self.clone())
    }

    async fn append_history_events(
        &self,
        _shard_id: i32,
        branch_token: &[u8],
        events: &[HistoryEvent],
    ) -> PersistenceResult<()> {
        let mut history = self.history_events.lock().expect("history poisoned");
        history
            .entry(branch_token.to_vec())
            .or_default()
            .extend_from_slice(events);
        Ok(())
    }

    async fn get_history_events(
        &self,
        branch_token: &[u8],
        min_event_id: i64,
        max_event_id: i64,
    ) -> PersistenceResult<Vec<HistoryEvent>> {
        let history = self.history_events.lock().expect("history poisoned");
        let Some(events) = history.get(branch_token) else {
            return Err(PersistenceError::NotFound("history branch".to_string()));
        };
        Ok(events
            .iter()
            .filter(|event| event.event_id >= min_event_id && event.event_id <= max_event_id)
            .cloned()
            .collect())
    }

    async fn create_history_branch(
        &self,
        token: &HistoryBranchToken,
        info: String,
    ) -> PersistenceResult<()> {
        let mut branches = self.history_branches.lock().expect("branches poisoned");
        branches
            .entry((token.tree_id, token.branch_id))
            .or_insert_with(|| HistoryBranchRecord {
                tree_id: token.tree_id,
                branch_id: token.branch_id,
                fork_time: Utc::now(),
                info,
            });
        Ok(())
    }

    async fn fork_history_branch(
        &self,
        _shard_id: i32,
        source_token: &[u8],
        new_token: &HistoryBranchToken,
        fork_event_id: i64,
        info: String,
    ) -> PersistenceResult<()> {
        let prefix: Vec<HistoryEvent> = {
            let history = self.history_events.lock().expect("history poisoned");
            let Some(events) = history.get(source_token) else {
                return Err(PersistenceError::NotFound("history branch".to_string()));
            };
            events
                .iter()
                .filter(|event| event.event_id <= fork_event_id)
                .cloned()
                .collect()
        };
        {
            let mut history = self.history_events.lock().expect("history poisoned");
            history.insert(new_token.encode(), prefix);
        }
        let mut branches = self.history_branches.lock().expect("branches poisoned");
        branches.insert(
            (new_token.tree_id, new_token.branch_id),
            HistoryBranchRecord {
                tree_id: new_token.tree_id,
                branch_id: new_token.branch_id,
                fork_time: Utc::now(),
                info,
            },
        );
        Ok(())
    }

    async fn get_all_history_tree_branches(
        &self,
        page_size: usize,
        next_page_token: Option<Vec<u8>>,
    ) -> PersistenceResult<HistoryBranchPage> {
        let offset = decode_page_token(next_page_token)?;
        let branches = self.history_branches.lock().expect("branches poisoned");
        let page: Vec<HistoryBranchRecord> = branches
            .values()
            .skip(offset)
            .take(page_size)
            .cloned()
            .collect();
        let next_offset = offset + page.len();
        let next_page_token = if next_offset < branches.len() {
            Some(serde_json::to_vec(&next_offset).expect("page token serializes"))
        } else {
            None
        };
        Ok(HistoryBranchPage {
            branches: page,
            next_page_token,
        })
    }

    async fn delete_history_branch(
        &self,
        _shard_id: i32,
        branch_token: &[u8],
    ) -> PersistenceResult<()> {
        let token = HistoryBranchToken::decode(branch_token)?;
        let mut branches = self.history_branches.lock().expect("branches poisoned");
        branches.remove(&(token.tree_id, token.branch_id));
        let mut history = self.history_events.lock().expect("history poisoned");
        history.remove(branch_token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use meridian_persistence::{HistoryStore, ShardStore, TaskStore};
    use meridian_persistence::{ShardInfo, TaskInfo, TaskListKey, TaskListKind, TaskListType};
    use uuid::Uuid;

    use crate::MemoryBackend;

    fn task_list_key() -> TaskListKey {
        TaskListKey {
            domain_id: "domain-1".to_string(),
            name: "orders".to_string(),
            task_type: TaskListType::Activity,
        }
    }

    fn task(task_id: i64) -> TaskInfo {
        TaskInfo {
            task_id,
            domain_id: "domain-1".to_string(),
            workflow_id: "wf".to_string(),
            run_id: Uuid::new_v4(),
            schedule_id: 5,
            created_time: chrono::Utc::now(),
            expiry: None,
        }
    }

    #[tokio::test]
    async fn shard_update_rejects_stale_range_id() {
        let backend = MemoryBackend::new();
        backend.create_shard(ShardInfo::new(3)).await.unwrap();

        let mut info = backend.get_shard(3).await.unwrap();
        info.range_id = 1;
        backend.update_shard(info.clone(), 0).await.unwrap();

        info.range_id = 5;
        let err = backend.update_shard(info, 0).await.unwrap_err();
        assert!(matches!(
            err,
            meridian_persistence::PersistenceError::ShardOwnershipLost { shard_id: 3, .. }
        ));
    }

    #[tokio::test]
    async fn stale_lease_cannot_create_tasks() {
        let backend = MemoryBackend::new();
        let key = task_list_key();

        let owner_a = backend
            .lease_task_list(&key, TaskListKind::Normal, 0)
            .await
            .unwrap();
        let owner_b = backend
            .lease_task_list(&key, TaskListKind::Normal, 0)
            .await
            .unwrap();
        assert_eq!(owner_b.range_id, owner_a.range_id + 1);

        let err = backend
            .create_tasks(&owner_a, vec![task(1)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            meridian_persistence::PersistenceError::ConditionFailed(_)
        ));

        backend.create_tasks(&owner_b, vec![task(1), task(2)]).await.unwrap();
        let tasks = backend.get_tasks(&key, 0, 10, 100).await.unwrap();
        assert_eq!(tasks.len(), 2);
    }

    #[tokio::test]
    async fn branch_listing_pages_through_all_rows() {
        let backend = MemoryBackend::new();
        for _ in 0..5 {
            backend.insert_history_branch(
                Uuid::new_v4(),
                Uuid::new_v4(),
                chrono::Utc::now(),
                "d:w:00000000-0000-0000-0000-000000000000".to_string(),
            );
        }

        let mut seen = 0;
        let mut token = None;
        loop {
            let page = backend
                .get_all_history_tree_branches(2, token.clone())
                .await
                .unwrap();
            seen += page.branches.len();
            token = page.next_page_token;
            if token.is_none() {
                break;
            }
        }
        assert_eq!(seen, 5);
    }
}
