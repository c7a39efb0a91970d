//! Cluster topology metadata.
//!
//! Each cluster owns a fixed residue class of failover versions: cluster `c`
//! produces versions `initial(c) + k * increment`. Resolving an event's
//! origin cluster is therefore pure arithmetic on its version.

use std::collections::HashMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("version {0} does not map to a known cluster")]
    UnknownVersion(i64),

    #[error("cluster {0} is not part of the topology")]
    UnknownCluster(String),
}

#[derive(Clone, Debug)]
pub struct ClusterMetadata {
    current_cluster: String,
    failover_version_increment: i64,
    initial_failover_versions: HashMap<String, i64>,
}

impl ClusterMetadata {
    pub fn new(
        current_cluster: impl Into<String>,
        failover_version_increment: i64,
        initial_failover_versions: HashMap<String, i64>,
    ) -> Self {
        Self {
            current_cluster: current_cluster.into(),
            failover_version_increment,
            initial_failover_versions,
        }
    }

    /// Single-cluster topology, the degenerate deployment.
    pub fn single(cluster: impl Into<String>) -> Self {
        let cluster = cluster.into();
        let mut initial = HashMap::new();
        initial.insert(cluster.clone(), 0);
        Self::new(cluster, 10, initial)
    }

    pub fn current_cluster(&self) -> &str {
        &self.current_cluster
    }

    pub fn clusters(&self) -> impl Iterator<Item = &str> {
        self.initial_failover_versions.keys().map(String::as_str)
    }

    /// The cluster that produced events carrying `version`.
    pub fn cluster_for_version(&self, version: i64) -> Result<&str, ClusterError> {
        let residue = version.rem_euclid(self.failover_version_increment);
        self.initial_failover_versions
            .iter()
            .find(|(_, initial)| **initial == residue)
            .map(|(name, _)| name.as_str())
            .ok_or(ClusterError::UnknownVersion(version))
    }

    pub fn is_version_from_current(&self, version: i64) -> bool {
        self.cluster_for_version(version)
            .map(|name| name == self.current_cluster)
            .unwrap_or(false)
    }

    /// The next failover version `cluster` would produce at or after
    /// `current_version`.
    pub fn next_failover_version(
        &self,
        cluster: &str,
        current_version: i64,
    ) -> Result<i64, ClusterError> {
        let initial = *self
            .initial_failover_versions
            .get(cluster)
            .ok_or_else(|| ClusterError::UnknownCluster(cluster.to_string()))?;
        let era = current_version.div_euclid(self.failover_version_increment);
        let candidate = era * self.failover_version_increment + initial;
        if candidate > current_version {
            Ok(candidate)
        } else {
            Ok(candidate + self.failover_version_increment)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_cluster() -> ClusterMetadata {
        let mut initial = HashMap::new();
        initial.insert("east".to_string(), 0);
        initial.insert("west".to_string(), 2);
        ClusterMetadata::new("east", 10, initial)
    }

    #[test]
    fn version_maps_to_origin_cluster() {
        let metadata = two_cluster();
        assert_eq!(metadata.cluster_for_version(0).unwrap(), "east");
        assert_eq!(metadata.cluster_for_version(20).unwrap(), "east");
        assert_eq!(metadata.cluster_for_version(12).unwrap(), "west");
        assert_eq!(
            metadata.cluster_for_version(13),
            Err(ClusterError::UnknownVersion(13))
        );
    }

    #[test]
    fn next_failover_version_is_strictly_greater() {
        let metadata = two_cluster();
        assert_eq!(metadata.next_failover_version("west", 0).unwrap(), 2);
        assert_eq!(metadata.next_failover_version("west", 2).unwrap(), 12);
        assert_eq!(metadata.next_failover_version("east", 2).unwrap(), 10);
    }
}
