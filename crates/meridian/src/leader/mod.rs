//! Lease-based leader election for the shard distributor.
//!
//! One election per namespace over a strongly-consistent coordinator. The
//! `done` watch flips when the session lapses; callers must treat that as
//! leadership loss and drop every shard-distribution decision cached under
//! the session. Assignment writes carry the session's fencing token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("session expired; leadership lost")]
    SessionExpired,

    #[error("campaign cancelled")]
    Cancelled,

    #[error("election backend failure: {0}")]
    Backend(String),
}

/// Entry point: one election handle per namespace.
#[async_trait::async_trait]
pub trait Elector: Send + Sync {
    async fn create_election(&self, namespace: &str) -> Result<Box<dyn Election>, ElectionError>;
}

#[async_trait::async_trait]
pub trait Election: Send + Sync {
    /// Block until this host holds leadership or the token fires.
    async fn campaign(
        &self,
        host: &str,
        cancellation: &CancellationToken,
    ) -> Result<(), ElectionError>;

    /// Give up leadership voluntarily.
    async fn resign(&self) -> Result<(), ElectionError>;

    /// Flips to `true` (or closes) when the session is lost.
    fn done(&self) -> watch::Receiver<bool>;

    /// Fenced handle to the namespace's shard assignments. Only valid while
    /// the session holds leadership.
    async fn shard_store(&self) -> Result<Box<dyn ShardAssignmentStore>, ElectionError>;

    /// Release session resources.
    async fn cleanup(&self) -> Result<(), ElectionError>;
}

/// Shard-to-host assignment state, writable only under a live session.
#[async_trait::async_trait]
pub trait ShardAssignmentStore: Send + Sync {
    async fn assign(&self, shard_id: i32, host: &str) -> Result<(), ElectionError>;
    async fn assignments(&self) -> Result<HashMap<i32, String>, ElectionError>;
}

#[derive(Clone, Debug)]
pub struct LeaseConfig {
    pub ttl: Duration,
    pub renew_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
            retry_interval: Duration::from_secs(1),
        }
    }
}

struct LeaderLease {
    host: String,
    session_id: Uuid,
    expires_at: Instant,
    fence: i64,
}

#[derive(Default)]
struct NamespaceState {
    leader: Option<LeaderLease>,
    next_fence: i64,
    assignments: HashMap<i32, String>,
}

type SharedNamespaces = Arc<tokio::sync::Mutex<HashMap<String, NamespaceState>>>;

/// In-process lease coordinator. Production deployments put an external
/// consistent store behind [`Elector`]; the lease semantics are identical.
#[derive(Clone, Default)]
pub struct LeaseElector {
    config: LeaseConfig,
    namespaces: SharedNamespaces,
}

impl LeaseElector {
    pub fn new(config: LeaseConfig) -> Self {
        Self {
            config,
            namespaces: Arc::default(),
        }
    }
}

#[async_trait::async_trait]
impl Elector for LeaseElector {
    async fn create_election(&self, namespace: &str) -> Result<Box<dyn Election>, ElectionError> {
        let (done_tx, done_rx) = watch::channel(false);
        Ok(Box::new(LeaseElection {
            namespace: namespace.to_string(),
            session_id: Uuid::new_v4(),
            config: self.config.clone(),
            namespaces: Arc::clone(&self.namespaces),
            done_tx: Arc::new(done_tx),
            done_rx,
            renewal: tokio::sync::Mutex::new(None),
        }))
    }
}

struct LeaseElection {
    namespace: String,
    session_id: Uuid,
    config: LeaseConfig,
    namespaces: SharedNamespaces,
    done_tx: Arc<watch::Sender<bool>>,
    done_rx: watch::Receiver<bool>,
    renewal: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LeaseElection {
    async fn try_acquire(&self, host: &str) -> bool {
        let mut namespaces = self.namespaces.lock().await;
        let state = namespaces.entry(self.namespace.clone()).or_default();
        let now = Instant::now();
        if let Some(lease) = &state.leader
            && lease.expires_at > now
        {
            debug!(
                namespace = %self.namespace,
                holder = %lease.host,
                fence = lease.fence,
                "namespace already led"
            );
            return false;
        }
        state.next_fence += 1;
        let fence = state.next_fence;
        state.leader = Some(LeaderLease {
            host: host.to_string(),
            session_id: self.session_id,
            expires_at: now + self.config.ttl,
            fence,
        });
        info!(namespace = %self.namespace, host, fence, "acquired leadership");
        true
    }

    fn spawn_renewal(&self) -> tokio::task::JoinHandle<()> {
        let namespaces = Arc::clone(&self.namespaces);
        let namespace = self.namespace.clone();
        let session_id = self.session_id;
        let done_tx = Arc::clone(&self.done_tx);
        let ttl = self.config.ttl;
        let renew_interval = self.config.renew_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(renew_interval).await;
                let mut namespaces = namespaces.lock().await;
                let Some(state) = namespaces.get_mut(&namespace) else {
                    break;
                };
                match &mut state.leader {
                    Some(lease) if lease.session_id == session_id => {
                        lease.expires_at = Instant::now() + ttl;
                        debug!(namespace = %namespace, "renewed leadership lease");
                    }
                    _ => {
                        warn!(namespace = %namespace, "leadership lease lost");
                        let _ = done_tx.send(true);
                        break;
                    }
                }
            }
        })
    }

    async fn is_session_live(&self) -> bool {
        let namespaces = self.namespaces.lock().await;
        namespaces
            .get(&self.namespace)
            .and_then(|state| state.leader.as_ref())
            .map(|lease| lease.session_id == self.session_id && lease.expires_at > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl Election for LeaseElection {
    async fn campaign(
        &self,
        host: &str,
        cancellation: &CancellationToken,
    ) -> Result<(), ElectionError> {
        loop {
            if self.try_acquire(host).await {
                let mut renewal = self.renewal.lock().await;
                *renewal = Some(self.spawn_renewal());
                return Ok(());
            }
            tokio::select! {
                _ = cancellation.cancelled() => return Err(ElectionError::Cancelled),
                _ = tokio::time::sleep(self.config.retry_interval) => {}
            }
        }
    }

    async fn resign(&self) -> Result<(), ElectionError> {
        {
            let mut namespaces = self.namespaces.lock().await;
            if let Some(state) = namespaces.get_mut(&self.namespace)
                && let Some(lease) = &state.leader
                && lease.session_id == self.session_id
            {
                state.leader = None;
            }
        }
        if let Some(task) = self.renewal.lock().await.take() {
            task.abort();
        }
        let _ = self.done_tx.send(true);
        info!(namespace = %self.namespace, "resigned leadership");
        Ok(())
    }

    fn done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    async fn shard_store(&self) -> Result<Box<dyn ShardAssignmentStore>, ElectionError> {
        if !self.is_session_live().await {
            return Err(ElectionError::SessionExpired);
        }
        Ok(Box::new(LeaseShardStore {
            namespace: self.namespace.clone(),
            session_id: self.session_id,
            namespaces: Arc::clone(&self.namespaces),
        }))
    }

    async fn cleanup(&self) -> Result<(), ElectionError> {
        self.resign().await
    }
}

impl Drop for LeaseElection {
    fn drop(&mut self) {
        // Stop renewing; the lease then lapses after its TTL and another
        // candidate may take the namespace.
        if let Ok(mut renewal) = self.renewal.try_lock()
            && let Some(task) = renewal.take()
        {
            task.abort();
        }
    }
}

struct LeaseShardStore {
    namespace: String,
    session_id: Uuid,
    namespaces: SharedNamespaces,
}

impl LeaseShardStore {
    async fn check_session<'a>(
        &self,
        namespaces: &'a mut HashMap<String, NamespaceState>,
    ) -> Result<&'a mut NamespaceState, ElectionError> {
        let state = namespaces
            .get_mut(&self.namespace)
            .ok_or(ElectionError::SessionExpired)?;
        let live = state
            .leader
            .as_ref()
            .map(|lease| {
                lease.session_id == self.session_id && lease.expires_at > Instant::now()
            })
            .unwrap_or(false);
        if !live {
            return Err(ElectionError::SessionExpired);
        }
        Ok(state)
    }
}

#[async_trait::async_trait]
impl ShardAssignmentStore for LeaseShardStore {
    async fn assign(&self, shard_id: i32, host: &str) -> Result<(), ElectionError> {
        let mut namespaces = self.namespaces.lock().await;
        let state = self.check_session(&mut namespaces).await?;
        state.assignments.insert(shard_id, host.to_string());
        Ok(())
    }

    async fn assignments(&self) -> Result<HashMap<i32, String>, ElectionError> {
        let mut namespaces = self.namespaces.lock().await;
        let state = self.check_session(&mut namespaces).await?;
        Ok(state.assignments.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> LeaseConfig {
        LeaseConfig {
            ttl: Duration::from_millis(100),
            renew_interval: Duration::from_millis(30),
            retry_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_leader_per_namespace() {
        let elector = LeaseElector::new(fast_config());
        let first = elector.create_election("shards").await.unwrap();
        let second = elector.create_election("shards").await.unwrap();

        let cancellation = CancellationToken::new();
        first.campaign("host-a", &cancellation).await.unwrap();

        // The second candidate stays blocked while the first renews.
        let contender = CancellationToken::new();
        let contender_clone = contender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            contender_clone.cancel();
        });
        let err = second.campaign("host-b", &contender).await.unwrap_err();
        assert!(matches!(err, ElectionError::Cancelled));

        // After a resign the namespace is free.
        first.resign().await.unwrap();
        second
            .campaign("host-b", &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn resign_signals_done() {
        let elector = LeaseElector::new(fast_config());
        let election = elector.create_election("shards").await.unwrap();
        election
            .campaign("host-a", &CancellationToken::new())
            .await
            .unwrap();

        let mut done = election.done();
        assert!(!*done.borrow());
        election.resign().await.unwrap();
        done.changed().await.unwrap();
        assert!(*done.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_session_cannot_write_assignments() {
        let elector = LeaseElector::new(fast_config());
        let first = elector.create_election("shards").await.unwrap();
        first
            .campaign("host-a", &CancellationToken::new())
            .await
            .unwrap();
        let store = first.shard_store().await.unwrap();
        store.assign(7, "host-a").await.unwrap();

        // A dropped election stops renewing; after the TTL the lease lapses
        // and another session takes over.
        drop(first);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let second = elector.create_election("shards").await.unwrap();
        second
            .campaign("host-b", &CancellationToken::new())
            .await
            .unwrap();

        let err = store.assign(8, "host-a").await.unwrap_err();
        assert!(matches!(err, ElectionError::SessionExpired));

        let fresh = second.shard_store().await.unwrap();
        fresh.assign(8, "host-b").await.unwrap();
        let assignments = fresh.assignments().await.unwrap();
        assert_eq!(assignments.get(&7).map(String::as_str), Some("host-a"));
        assert_eq!(assignments.get(&8).map(String::as_str), Some("host-b"));
    }
}
