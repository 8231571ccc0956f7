//! Client-side routing cache.
//!
//! Memoizes vbucket -> primary node decisions derived from the latest bucket
//! snapshot a client has received. An epoch change drops every decision; a
//! newer revision in the same epoch drops only the decisions whose owner
//! moved.

use crate::snapshot::{BucketTopology, TopologyVersion, Versioned};
use std::collections::HashMap;
use std::sync::Arc;

/// What [`RoutingCache::apply`] did with a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    /// First snapshot seen.
    Initialized,
    /// Epoch increased; all cached decisions were discarded.
    Reset,
    /// Same epoch, newer revision; `invalidated` decisions were dropped.
    Advanced { invalidated: usize },
    /// Snapshot was not newer than the cached one.
    Ignored,
}

#[derive(Debug, Default)]
pub struct RoutingCache {
    snapshot: Option<Arc<BucketTopology>>,
    decisions: HashMap<u32, String>,
}

impl RoutingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> Option<TopologyVersion> {
        self.snapshot.as_ref().map(|s| s.version())
    }

    pub fn snapshot(&self) -> Option<&Arc<BucketTopology>> {
        self.snapshot.as_ref()
    }

    /// Number of memoized routing decisions.
    pub fn cached_decisions(&self) -> usize {
        self.decisions.len()
    }

    /// Adopt `next` if it is newer than the cached snapshot.
    pub fn apply(&mut self, next: Arc<BucketTopology>) -> CacheUpdate {
        let current = match self.version() {
            None => {
                self.snapshot = Some(next);
                return CacheUpdate::Initialized;
            }
            Some(v) => v,
        };

        let incoming = next.version();
        if incoming <= current {
            return CacheUpdate::Ignored;
        }

        if current.is_epoch_change(&incoming) {
            self.decisions.clear();
            self.snapshot = Some(next);
            return CacheUpdate::Reset;
        }

        let before = self.decisions.len();
        self.decisions.retain(|vb, node| {
            next.primary_for(*vb)
                .map(|owner| owner.node_id == *node)
                .unwrap_or(false)
        });
        let invalidated = before - self.decisions.len();
        self.snapshot = Some(next);
        CacheUpdate::Advanced { invalidated }
    }

    /// Node id of the primary for `vbucket`, memoizing the answer.
    pub fn route(&mut self, vbucket: u32) -> Option<&str> {
        if !self.decisions.contains_key(&vbucket) {
            let owner = self.snapshot.as_ref()?.primary_for(vbucket)?.node_id.clone();
            self.decisions.insert(vbucket, owner);
        }
        self.decisions.get(&vbucket).map(String::as_str)
    }
}
