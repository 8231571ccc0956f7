//! Node identity and partition-ownership records.

use std::sync::Arc;

/// Identity and capability record for one cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Server {
    /// Network-reachable host identifier (`host:port` or hostname).
    pub host_id: String,

    /// Cluster-internal identifier, unique within one snapshot.
    pub node_id: String,

    /// Fault-domain label.
    pub server_group: String,

    pub has_mgmt: bool,
    pub has_kv: bool,
    pub has_views: bool,
    pub has_query: bool,
    pub has_analytics: bool,
    pub has_search: bool,
}

impl Server {
    /// Create a server with no capabilities.
    pub fn new(
        host_id: impl Into<String>,
        node_id: impl Into<String>,
        server_group: impl Into<String>,
    ) -> Self {
        Self {
            host_id: host_id.into(),
            node_id: node_id.into(),
            server_group: server_group.into(),
            ..Default::default()
        }
    }

    pub fn with_mgmt(mut self) -> Self {
        self.has_mgmt = true;
        self
    }

    pub fn with_kv(mut self) -> Self {
        self.has_kv = true;
        self
    }

    pub fn with_views(mut self) -> Self {
        self.has_views = true;
        self
    }

    pub fn with_query(mut self) -> Self {
        self.has_query = true;
        self
    }

    pub fn with_analytics(mut self) -> Self {
        self.has_analytics = true;
        self
    }

    pub fn with_search(mut self) -> Self {
        self.has_search = true;
        self
    }
}

/// Marker for "this server holds no replica of the partition".
pub const NO_REPLICA: i32 = -1;

/// A server's partition-ownership view for one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataServer {
    /// Shared with the owning snapshot's server list.
    pub server: Arc<Server>,

    /// Partitions this node owns as primary, in ascending order.
    pub vbuckets: Vec<u32>,

    /// One entry per partition of the bucket: the replica ordinal (1-based)
    /// this node holds for that partition, or [`NO_REPLICA`].
    pub vbucket_replicas: Vec<i32>,
}

impl DataServer {
    pub fn new(server: Arc<Server>, vbuckets: Vec<u32>, vbucket_replicas: Vec<i32>) -> Self {
        Self {
            server,
            vbuckets,
            vbucket_replicas,
        }
    }

    /// Replica ordinal this node holds for `vbucket`, if any.
    pub fn replica_of(&self, vbucket: u32) -> Option<u32> {
        match self.vbucket_replicas.get(vbucket as usize) {
            Some(&ordinal) if ordinal > 0 => Some(ordinal as u32),
            _ => None,
        }
    }
}
