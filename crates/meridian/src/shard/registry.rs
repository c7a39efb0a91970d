//! Engine registry.
//!
//! A shard never holds its engine directly; it holds the shard id into this
//! registry. Teardown is explicit: unregister the engine, then drop the
//! shard.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use meridian_persistence::{ReplicationTask, TimerTask, TransferTask};

/// Notification surface a shard publishes into. Wake-ups are best-effort;
/// consumers always re-check persistence to find work.
pub trait Engine: Send + Sync {
    fn notify_new_transfer_tasks(&self, tasks: &[TransferTask]);
    fn notify_new_timer_tasks(&self, tasks: &[TimerTask]);
    fn notify_new_replication_tasks(&self, tasks: &[ReplicationTask]);
}

/// Engine that swallows every notification. Test stand-in.
pub struct NoopEngine;

impl Engine for NoopEngine {
    fn notify_new_transfer_tasks(&self, _tasks: &[TransferTask]) {}
    fn notify_new_timer_tasks(&self, _tasks: &[TimerTask]) {}
    fn notify_new_replication_tasks(&self, _tasks: &[ReplicationTask]) {}
}

#[derive(Default)]
pub struct EngineRegistry {
    engines: Mutex<HashMap<i32, Arc<dyn Engine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, shard_id: i32, engine: Arc<dyn Engine>) {
        let mut engines = self.engines.lock().expect("engine registry poisoned");
        engines.insert(shard_id, engine);
    }

    pub fn unregister(&self, shard_id: i32) {
        let mut engines = self.engines.lock().expect("engine registry poisoned");
        engines.remove(&shard_id);
    }

    pub fn get(&self, shard_id: i32) -> Option<Arc<dyn Engine>> {
        let engines = self.engines.lock().expect("engine registry poisoned");
        engines.get(&shard_id).cloned()
    }
}
