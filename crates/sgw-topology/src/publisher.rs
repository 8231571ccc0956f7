//! Latest-snapshot cells for the cluster and each bucket.
//!
//! Readers get `Arc` clones of the current snapshot without locking the
//! publisher; subscribers are woken on every accepted publication. The
//! version check and the swap both run under the watch channel's write lock,
//! so concurrent publishers can never interleave a lower version.

use crate::error::TopologyError;
use crate::snapshot::{BucketTopology, Topology, TopologyVersion, Versioned};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Publishes versioned topology snapshots to any number of readers.
pub struct TopologyPublisher {
    cluster: watch::Sender<Arc<Topology>>,
    buckets: RwLock<BucketCells>,
}

#[derive(Default)]
struct BucketCells {
    live: HashMap<String, watch::Sender<Arc<BucketTopology>>>,
    /// Last version published under each removed name.
    retired: HashMap<String, TopologyVersion>,
}

impl TopologyPublisher {
    /// Create a publisher seeded with the initial cluster snapshot.
    pub fn new(initial: Topology) -> Self {
        let (cluster, _) = watch::channel(Arc::new(initial));
        Self {
            cluster,
            buckets: RwLock::new(BucketCells::default()),
        }
    }

    /// Latest cluster snapshot.
    pub fn current(&self) -> Arc<Topology> {
        self.cluster.borrow().clone()
    }

    /// Receiver woken on each new cluster snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Topology>> {
        self.cluster.subscribe()
    }

    /// Replace the cluster snapshot.
    ///
    /// Fails with [`TopologyError::OutOfOrder`] if `next` is not strictly
    /// newer than the current snapshot; the current snapshot stays in place.
    pub fn publish(&self, next: Topology) -> Result<Arc<Topology>, TopologyError> {
        let next = Arc::new(next);
        swap_if_newer(&self.cluster, next.clone()).map_err(|e| {
            tracing::error!(error = %e, "Rejected cluster topology publication");
            e
        })?;
        tracing::info!(version = %next.version(), servers = next.servers().len(), "Published cluster topology");
        Ok(next)
    }

    /// Replace (or create) the snapshot for `bucket`.
    ///
    /// The first snapshot for a bucket is accepted at any version; later ones
    /// must be strictly newer. Versions keep rising across removal: a name
    /// that was removed only comes back above the last version it carried.
    pub fn publish_bucket(
        &self,
        bucket: &str,
        next: BucketTopology,
    ) -> Result<Arc<BucketTopology>, TopologyError> {
        let next = Arc::new(next);
        let mut buckets = self.buckets.write();

        match buckets.live.get(bucket) {
            Some(sender) => {
                swap_if_newer(sender, next.clone()).map_err(|e| {
                    tracing::error!(bucket, error = %e, "Rejected bucket topology publication");
                    e
                })?;
            }
            None => {
                if let Some(&last) = buckets.retired.get(bucket) {
                    if next.version() <= last {
                        let err = TopologyError::OutOfOrder {
                            current: last,
                            attempted: next.version(),
                        };
                        tracing::error!(bucket, error = %err, "Rejected bucket topology publication");
                        return Err(err);
                    }
                    buckets.retired.remove(bucket);
                }
                let (sender, _) = watch::channel(next.clone());
                buckets.live.insert(bucket.to_string(), sender);
            }
        }

        tracing::info!(bucket, version = %next.version(), "Published bucket topology");
        Ok(next)
    }

    /// Latest snapshot for `bucket`.
    pub fn bucket(&self, bucket: &str) -> Option<Arc<BucketTopology>> {
        self.buckets.read().live.get(bucket).map(|s| s.borrow().clone())
    }

    /// Receiver woken on each new snapshot for `bucket`.
    ///
    /// The receiver's `changed()` fails once the bucket is removed.
    pub fn subscribe_bucket(&self, bucket: &str) -> Option<watch::Receiver<Arc<BucketTopology>>> {
        self.buckets.read().live.get(bucket).map(|s| s.subscribe())
    }

    /// Forget `bucket`, closing every subscription to it. Its last version
    /// is kept as the floor for any later publication under the same name.
    pub fn remove_bucket(&self, bucket: &str) -> bool {
        let mut buckets = self.buckets.write();
        let Some(sender) = buckets.live.remove(bucket) else {
            return false;
        };
        let last = sender.borrow().version();
        buckets.retired.insert(bucket.to_string(), last);
        tracing::info!(bucket, version = %last, "Removed bucket topology");
        true
    }

    pub fn bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buckets.read().live.keys().cloned().collect();
        names.sort();
        names
    }
}

fn swap_if_newer<T: Versioned>(
    sender: &watch::Sender<Arc<T>>,
    next: Arc<T>,
) -> Result<(), TopologyError> {
    let mut rejected = None;
    sender.send_if_modified(|current| {
        let (cur, att) = (current.version(), next.version());
        if att <= cur {
            rejected = Some(TopologyError::OutOfOrder {
                current: cur,
                attempted: att,
            });
            false
        } else {
            *current = next.clone();
            true
        }
    });
    match rejected {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
