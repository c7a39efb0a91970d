//! Compressed version histories for replicated workflow runs.
//!
//! A run's event log is summarized as an ordered list of `(event_id, version)`
//! endpoints: each endpoint marks the last event produced under that failover
//! version. Concurrent failovers can fork the log, so a run carries a set of
//! branches sharing a common prefix, exactly one of which is current.

use serde::{Deserialize, Serialize};

/// The first valid event id of a run. Event ids are 1-based and dense.
pub const FIRST_EVENT_ID: i64 = 1;

/// Failover version assigned to events written before the domain became
/// global. Compares lower than every real cluster version.
pub const EMPTY_VERSION: i64 = -24;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VersionHistoryError {
    #[error("version history is empty")]
    Empty,

    #[error("event id {event_id} does not increase the branch tip {tip_event_id}")]
    EventIdNotIncreasing { event_id: i64, tip_event_id: i64 },

    #[error("version {version} is lower than the branch tip version {tip_version}")]
    VersionDecreasing { version: i64, tip_version: i64 },

    #[error("histories share no common ancestor")]
    NoCommonAncestor,

    #[error("version history index {index} out of range ({len} histories)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("item ({event_id}, {version}) not found in any version history")]
    ItemNotFound { event_id: i64, version: i64 },
}

/// One endpoint of a version history: the last event id produced under
/// `version`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionHistoryItem {
    pub event_id: i64,
    pub version: i64,
}

impl VersionHistoryItem {
    pub fn new(event_id: i64, version: i64) -> Self {
        Self { event_id, version }
    }
}

/// A single branch of a run's event log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistory {
    /// Opaque storage token locating the branch's events.
    pub branch_token: Vec<u8>,
    items: Vec<VersionHistoryItem>,
}

impl VersionHistory {
    pub fn new(branch_token: Vec<u8>, items: Vec<VersionHistoryItem>) -> Self {
        Self {
            branch_token,
            items,
        }
    }

    pub fn items(&self) -> &[VersionHistoryItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn first_item(&self) -> Result<VersionHistoryItem, VersionHistoryError> {
        self.items
            .first()
            .copied()
            .ok_or(VersionHistoryError::Empty)
    }

    pub fn last_item(&self) -> Result<VersionHistoryItem, VersionHistoryError> {
        self.items.last().copied().ok_or(VersionHistoryError::Empty)
    }

    pub fn set_branch_token(&mut self, token: Vec<u8>) {
        self.branch_token = token;
    }

    /// Record that `item.event_id` is now the last event produced under
    /// `item.version`. Extends the tip endpoint when the version matches,
    /// appends a new endpoint when the version advances.
    pub fn update(&mut self, item: VersionHistoryItem) -> Result<(), VersionHistoryError> {
        let Some(tip) = self.items.last_mut() else {
            self.items.push(item);
            return Ok(());
        };
        if item.version < tip.version {
            return Err(VersionHistoryError::VersionDecreasing {
                version: item.version,
                tip_version: tip.version,
            });
        }
        if item.event_id <= tip.event_id {
            return Err(VersionHistoryError::EventIdNotIncreasing {
                event_id: item.event_id,
                tip_event_id: tip.event_id,
            });
        }
        if item.version == tip.version {
            tip.event_id = item.event_id;
        } else {
            self.items.push(item);
        }
        Ok(())
    }

    /// Whether this branch covers the given `(event_id, version)` pair.
    pub fn contains(&self, item: VersionHistoryItem) -> bool {
        let mut prev_event_id = FIRST_EVENT_ID - 1;
        for endpoint in &self.items {
            if item.version == endpoint.version {
                if prev_event_id < item.event_id && item.event_id <= endpoint.event_id {
                    return true;
                }
            } else if item.version < endpoint.version {
                return false;
            }
            prev_event_id = endpoint.event_id;
        }
        false
    }

    /// The failover version that produced `event_id` on this branch, if
    /// the branch covers it.
    pub fn version_for_event(&self, event_id: i64) -> Option<i64> {
        let mut prev_event_id = FIRST_EVENT_ID - 1;
        for endpoint in &self.items {
            if prev_event_id < event_id && event_id <= endpoint.event_id {
                return Some(endpoint.version);
            }
            prev_event_id = endpoint.event_id;
        }
        None
    }

    /// The lowest common ancestor endpoint of this branch and `other`:
    /// the highest `(event_id, version)` pair both branches cover.
    pub fn lca(&self, other: &VersionHistory) -> Result<VersionHistoryItem, VersionHistoryError> {
        let mut local = self.items.len();
        let mut remote = other.items.len();
        while local > 0 && remote > 0 {
            let local_item = self.items[local - 1];
            let remote_item = other.items[remote - 1];
            if local_item.version == remote_item.version {
                let event_id = local_item.event_id.min(remote_item.event_id);
                return Ok(VersionHistoryItem::new(event_id, local_item.version));
            }
            if local_item.version > remote_item.version {
                local -= 1;
            } else {
                remote -= 1;
            }
        }
        Err(VersionHistoryError::NoCommonAncestor)
    }

    /// Whether `item` sits exactly on this branch's tip, i.e. new events may
    /// be appended directly after it.
    pub fn is_appendable(&self, item: VersionHistoryItem) -> bool {
        self.items.last() == Some(&item)
    }
}

/// All branches of a run, with exactly one marked current.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistories {
    current_index: usize,
    histories: Vec<VersionHistory>,
}

impl VersionHistories {
    pub fn new(history: VersionHistory) -> Self {
        Self {
            current_index: 0,
            histories: vec![history],
        }
    }

    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn history(&self, index: usize) -> Result<&VersionHistory, VersionHistoryError> {
        self.histories
            .get(index)
            .ok_or(VersionHistoryError::IndexOutOfRange {
                index,
                len: self.histories.len(),
            })
    }

    pub fn history_mut(&mut self, index: usize) -> Result<&mut VersionHistory, VersionHistoryError> {
        let len = self.histories.len();
        self.histories
            .get_mut(index)
            .ok_or(VersionHistoryError::IndexOutOfRange { index, len })
    }

    pub fn current(&self) -> &VersionHistory {
        &self.histories[self.current_index]
    }

    pub fn current_mut(&mut self) -> &mut VersionHistory {
        &mut self.histories[self.current_index]
    }

    pub fn set_current_index(&mut self, index: usize) -> Result<(), VersionHistoryError> {
        if index >= self.histories.len() {
            return Err(VersionHistoryError::IndexOutOfRange {
                index,
                len: self.histories.len(),
            });
        }
        self.current_index = index;
        Ok(())
    }

    /// Add a forked branch. Returns its index; an identical existing branch
    /// is reused rather than duplicated.
    pub fn add(&mut self, history: VersionHistory) -> usize {
        if let Some(index) = self.histories.iter().position(|h| *h == history) {
            return index;
        }
        self.histories.push(history);
        self.histories.len() - 1
    }

    /// Find the branch sharing the highest lowest-common-ancestor with
    /// `incoming`, returning its index and the LCA endpoint.
    pub fn find_lca(
        &self,
        incoming: &VersionHistory,
    ) -> Result<(usize, VersionHistoryItem), VersionHistoryError> {
        let mut best: Option<(usize, VersionHistoryItem)> = None;
        for (index, history) in self.histories.iter().enumerate() {
            let item = history.lca(incoming)?;
            match best {
                Some((_, best_item)) if best_item.event_id >= item.event_id => {}
                _ => best = Some((index, item)),
            }
        }
        best.ok_or(VersionHistoryError::NoCommonAncestor)
    }

    /// Index of the first branch covering `item`.
    pub fn find_first_containing(
        &self,
        item: VersionHistoryItem,
    ) -> Result<usize, VersionHistoryError> {
        self.histories
            .iter()
            .position(|h| h.contains(item))
            .ok_or(VersionHistoryError::ItemNotFound {
                event_id: item.event_id,
                version: item.version,
            })
    }
}
