//! Immutable topology snapshots.
//!
//! Both snapshot kinds are validated on construction, so holding one means
//! its invariants hold. Versions order lexicographically by epoch then
//! revision; revisions are only comparable within one epoch.

use crate::error::TopologyError;
use crate::server::{DataServer, Server, NO_REPLICA};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// `(rev_epoch, revision)` pair.
///
/// Field order matters: the derived `Ord` compares `rev_epoch` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TopologyVersion {
    pub rev_epoch: u64,
    pub revision: u64,
}

impl TopologyVersion {
    pub const fn new(rev_epoch: u64, revision: u64) -> Self {
        Self {
            rev_epoch,
            revision,
        }
    }

    /// True when moving from `self` to `next` crosses an epoch boundary,
    /// meaning `next` must be treated as a full replacement.
    pub fn is_epoch_change(&self, next: &TopologyVersion) -> bool {
        next.rev_epoch > self.rev_epoch
    }
}

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rev_epoch, self.revision)
    }
}

/// Anything carrying a topology version.
pub trait Versioned {
    fn version(&self) -> TopologyVersion;
}

/// Cluster-wide membership snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    rev_epoch: u64,
    revision: u64,
    servers: Vec<Arc<Server>>,
}

impl Topology {
    pub fn new(
        rev_epoch: u64,
        revision: u64,
        servers: Vec<Arc<Server>>,
    ) -> Result<Self, TopologyError> {
        check_unique_node_ids(&servers)?;
        Ok(Self {
            rev_epoch,
            revision,
            servers,
        })
    }

    pub fn rev_epoch(&self) -> u64 {
        self.rev_epoch
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    pub fn server(&self, node_id: &str) -> Option<&Arc<Server>> {
        self.servers.iter().find(|s| s.node_id == node_id)
    }
}

impl Versioned for Topology {
    fn version(&self) -> TopologyVersion {
        TopologyVersion::new(self.rev_epoch, self.revision)
    }
}

/// One bucket's partition map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketTopology {
    rev_epoch: u64,
    revision: u64,
    num_vbuckets: u32,
    servers: Vec<Arc<Server>>,
    data_servers: Vec<DataServer>,
    /// `owners[v]` is the index into `data_servers` of the primary for `v`.
    owners: Vec<usize>,
}

impl BucketTopology {
    /// Build a bucket snapshot, checking that every partition in
    /// `0..num_vbuckets` has exactly one primary owner.
    pub fn new(
        rev_epoch: u64,
        revision: u64,
        num_vbuckets: u32,
        servers: Vec<Arc<Server>>,
        data_servers: Vec<DataServer>,
    ) -> Result<Self, TopologyError> {
        check_unique_node_ids(&servers)?;

        let known: HashSet<&str> = servers.iter().map(|s| s.node_id.as_str()).collect();
        let mut owners: Vec<Option<usize>> = vec![None; num_vbuckets as usize];

        for (idx, ds) in data_servers.iter().enumerate() {
            let node_id = ds.server.node_id.as_str();
            if !known.contains(node_id) {
                return Err(TopologyError::malformed(format!(
                    "data server {} is not in the bucket's server list",
                    node_id
                )));
            }

            for &vb in &ds.vbuckets {
                let slot = owners.get_mut(vb as usize).ok_or_else(|| {
                    TopologyError::malformed(format!(
                        "vbucket {} on {} is outside 0..{}",
                        vb, node_id, num_vbuckets
                    ))
                })?;
                if let Some(prev) = slot.replace(idx) {
                    return Err(TopologyError::malformed(format!(
                        "vbucket {} has two primaries: {} and {}",
                        vb, data_servers[prev].server.node_id, node_id
                    )));
                }
            }

            if ds.vbucket_replicas.len() != num_vbuckets as usize {
                return Err(TopologyError::malformed(format!(
                    "data server {} has {} replica entries, expected {}",
                    node_id,
                    ds.vbucket_replicas.len(),
                    num_vbuckets
                )));
            }
            if let Some(bad) = ds.vbucket_replicas.iter().find(|&&r| r < NO_REPLICA) {
                return Err(TopologyError::malformed(format!(
                    "data server {} has invalid replica ordinal {}",
                    node_id, bad
                )));
            }
        }

        // A node never replicates a partition it owns.
        for (idx, ds) in data_servers.iter().enumerate() {
            for (vb, &ordinal) in ds.vbucket_replicas.iter().enumerate() {
                if ordinal > 0 && owners[vb] == Some(idx) {
                    return Err(TopologyError::malformed(format!(
                        "data server {} is both primary and replica of vbucket {}",
                        ds.server.node_id, vb
                    )));
                }
            }
        }

        let owners = owners
            .into_iter()
            .enumerate()
            .map(|(vb, owner)| {
                owner.ok_or_else(|| {
                    TopologyError::malformed(format!("vbucket {} has no primary owner", vb))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rev_epoch,
            revision,
            num_vbuckets,
            servers,
            data_servers,
            owners,
        })
    }

    pub fn rev_epoch(&self) -> u64 {
        self.rev_epoch
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn num_vbuckets(&self) -> u32 {
        self.num_vbuckets
    }

    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    pub fn data_servers(&self) -> &[DataServer] {
        &self.data_servers
    }

    /// Primary owner of `vbucket`, or `None` if it is out of range.
    pub fn primary_for(&self, vbucket: u32) -> Option<&Arc<Server>> {
        self.owners
            .get(vbucket as usize)
            .map(|&idx| &self.data_servers[idx].server)
    }

    /// Servers holding a replica of `vbucket`, ordered by replica ordinal.
    pub fn replicas_for(&self, vbucket: u32) -> Vec<&Arc<Server>> {
        let mut replicas: Vec<(u32, &Arc<Server>)> = self
            .data_servers
            .iter()
            .filter_map(|ds| ds.replica_of(vbucket).map(|ord| (ord, &ds.server)))
            .collect();
        replicas.sort_by_key(|(ord, _)| *ord);
        replicas.into_iter().map(|(_, s)| s).collect()
    }
}

impl Versioned for BucketTopology {
    fn version(&self) -> TopologyVersion {
        TopologyVersion::new(self.rev_epoch, self.revision)
    }
}

fn check_unique_node_ids(servers: &[Arc<Server>]) -> Result<(), TopologyError> {
    let mut seen = HashSet::with_capacity(servers.len());
    for server in servers {
        if !seen.insert(server.node_id.as_str()) {
            return Err(TopologyError::malformed(format!(
                "duplicate node id {}",
                server.node_id
            )));
        }
    }
    Ok(())
}
