//! Domain metadata resolution.
//!
//! Domain CRUD lives outside the engine; replication and reconciliation only
//! need the read view: name, retention, and replication topology.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Read view of one domain.
#[derive(Clone, Debug)]
pub struct DomainEntry {
    pub id: String,
    pub name: String,
    pub retention: Duration,
    pub active_cluster: String,
    pub clusters: Vec<String>,
    pub failover_version: i64,
}

impl DomainEntry {
    pub fn is_global(&self) -> bool {
        self.clusters.len() > 1
    }

    pub fn is_active_in(&self, cluster: &str) -> bool {
        self.active_cluster == cluster
    }
}

/// Lookup of domain metadata by id.
pub trait DomainResolver: Send + Sync {
    fn domain_by_id(&self, domain_id: &str) -> Option<DomainEntry>;

    fn domain_name(&self, domain_id: &str) -> Option<String> {
        self.domain_by_id(domain_id).map(|entry| entry.name)
    }
}

/// Table-backed resolver for tests and static deployments.
#[derive(Clone, Default)]
pub struct StaticDomainResolver {
    entries: Arc<Mutex<HashMap<String, DomainEntry>>>,
}

impl StaticDomainResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: DomainEntry) {
        let mut entries = self.entries.lock().expect("domain entries poisoned");
        entries.insert(entry.id.clone(), entry);
    }
}

impl DomainResolver for StaticDomainResolver {
    fn domain_by_id(&self, domain_id: &str) -> Option<DomainEntry> {
        let entries = self.entries.lock().expect("domain entries poisoned");
        entries.get(domain_id).cloned()
    }
}
