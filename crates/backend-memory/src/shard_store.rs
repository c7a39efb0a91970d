use meridian_persistence::{PersistenceError, PersistenceResult, ShardInfo};

#[async_trait::async_trait]
impl meridian_persistence::ShardStore for crate::MemoryBackend {
    fn clone_box(&self) -> Box<dyn meridian_persistence::ShardStore> {
        Box::new(self.clone())
    }

    async fn create_shard(&self, info: ShardInfo) -> PersistenceResult<()> {
        let mut shards = self.shards.lock().expect("shards poisoned");
        shards.entry(info.shard_id).or_insert(info);
        Ok(())
    }

    async fn get_shard(&self, shard_id: i32) -> PersistenceResult<ShardInfo> {
        let shards = self.shards.lock().expect("shards poisoned");
        shards
            .get(&shard_id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(format!("shard {shard_id}")))
    }

    async fn update_shard(
        &self,
        info: ShardInfo,
        expected_range_id: i64,
    ) -> PersistenceResult<()> {
        let mut shards = self.shards.lock().expect("shards poisoned");
        let shard_id = info.shard_id;
        let stored = shards
            .get_mut(&shard_id)
            .ok_or_else(|| PersistenceError::NotFound(format!("shard {shard_id}")))?;
        if stored.range_id != expected_range_id {
            return Err(PersistenceError::ShardOwnershipLost {
                shard_id,
                message: format!(
                    "expected range id {expected_range_id}, stored {}",
                    stored.range_id
                ),
            });
        }
        *stored = info;
        Ok(())
    }
}
