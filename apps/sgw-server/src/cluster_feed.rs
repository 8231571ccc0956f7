//! Cluster feed.
//!
//! Owns the cluster state the gateway routes against (members, buckets,
//! partition count) and turns membership events into new topology
//! snapshots on the shared [`TopologyPublisher`]:
//! - NodeAdded / NodeRemoved / BucketCreated / BucketDeleted bump the revision
//! - Failover starts a new epoch at revision 0
//!
//! Partitions are assigned round-robin over kv-capable members. A rejected
//! event leaves the last good snapshot in place.

use crate::config::{ClusterConfig, NodeConfig, NodeService};
use parking_lot::Mutex;
use sgw_topology::{
    BucketTopology, DataServer, Server, Topology, TopologyError, TopologyPublisher, Versioned,
};
use sgw_transport_grpc::backend::{BackendEvent, MemoryBackend};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Membership and catalog changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    NodeAdded(NodeConfig),
    NodeRemoved { node_id: String },
    /// Unplanned loss of a node; its partitions move to the survivors.
    Failover { node_id: String },
    BucketCreated { name: String },
    BucketDeleted { name: String },
}

#[derive(Debug, Clone)]
struct FeedState {
    nodes: Vec<NodeConfig>,
    buckets: BTreeSet<String>,
    rev_epoch: u64,
    revision: u64,
}

/// Source of topology snapshots.
pub struct ClusterFeed {
    publisher: Arc<TopologyPublisher>,
    state: Mutex<FeedState>,
    num_vbuckets: u32,
    num_replicas: u32,
}

impl ClusterFeed {
    /// Build the initial `(0, 0)` snapshots from configuration.
    pub fn new(config: &ClusterConfig) -> Result<Self, ClusterFeedError> {
        let state = FeedState {
            nodes: config.nodes.clone(),
            buckets: config.buckets.iter().cloned().collect(),
            rev_epoch: 0,
            revision: 0,
        };

        let (cluster, buckets) = build(&state, config.num_vbuckets, config.num_replicas)?;
        let publisher = Arc::new(TopologyPublisher::new(cluster));
        for (name, bucket) in buckets {
            publisher.publish_bucket(&name, bucket)?;
        }

        tracing::info!(
            nodes = state.nodes.len(),
            buckets = state.buckets.len(),
            num_vbuckets = config.num_vbuckets,
            "Cluster feed initialized"
        );

        Ok(Self {
            publisher,
            state: Mutex::new(state),
            num_vbuckets: config.num_vbuckets,
            num_replicas: config.num_replicas,
        })
    }

    pub fn publisher(&self) -> Arc<TopologyPublisher> {
        self.publisher.clone()
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.state.lock().buckets.iter().cloned().collect()
    }

    /// Apply an event and publish the resulting snapshots.
    pub fn apply(&self, event: ClusterEvent) -> Result<(), ClusterFeedError> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let mut removed_bucket = None;

        match &event {
            ClusterEvent::NodeAdded(node) => {
                if next.nodes.iter().any(|n| n.node_id == node.node_id) {
                    return Err(ClusterFeedError::DuplicateNode(node.node_id.clone()));
                }
                next.nodes.push(node.clone());
                next.revision += 1;
            }
            ClusterEvent::NodeRemoved { node_id } => {
                remove_node(&mut next, node_id)?;
                next.revision += 1;
            }
            ClusterEvent::Failover { node_id } => {
                remove_node(&mut next, node_id)?;
                next.rev_epoch += 1;
                next.revision = 0;
            }
            ClusterEvent::BucketCreated { name } => {
                if !next.buckets.insert(name.clone()) {
                    return Err(ClusterFeedError::DuplicateBucket(name.clone()));
                }
                next.revision += 1;
            }
            ClusterEvent::BucketDeleted { name } => {
                if !next.buckets.remove(name) {
                    return Err(ClusterFeedError::UnknownBucket(name.clone()));
                }
                removed_bucket = Some(name.clone());
                next.revision += 1;
            }
        }

        let (cluster, buckets) = build(&next, self.num_vbuckets, self.num_replicas)?;
        self.ensure_newer(&cluster, &buckets)?;

        self.publisher.publish(cluster)?;
        // The cluster version has moved; later events must build on `next`
        // even if a bucket below is rejected.
        let (rev_epoch, revision) = (next.rev_epoch, next.revision);
        *state = next;

        let mut rejected = None;
        for (name, bucket) in buckets {
            if let Err(e) = self.publisher.publish_bucket(&name, bucket) {
                tracing::warn!(bucket = %name, error = %e, "Bucket snapshot rejected; keeping its last map");
                rejected.get_or_insert(e);
            }
        }
        if let Some(name) = removed_bucket {
            self.publisher.remove_bucket(&name);
        }

        tracing::info!(event = ?event, rev_epoch, revision, "Applied cluster event");
        match rejected {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Reject the whole event up front if any snapshot it would publish is
    /// not newer than what readers already have.
    fn ensure_newer(
        &self,
        cluster: &Topology,
        buckets: &[(String, BucketTopology)],
    ) -> Result<(), TopologyError> {
        let current = self.publisher.current().version();
        if cluster.version() <= current {
            return Err(TopologyError::OutOfOrder {
                current,
                attempted: cluster.version(),
            });
        }
        for (name, bucket) in buckets {
            if let Some(existing) = self.publisher.bucket(name) {
                if bucket.version() <= existing.version() {
                    return Err(TopologyError::OutOfOrder {
                        current: existing.version(),
                        attempted: bucket.version(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Follow bucket changes made through the memory backend's admin API.
    pub fn follow(self: Arc<Self>, backend: &MemoryBackend, cancel: CancellationToken) -> JoinHandle<()> {
        let mut events = backend.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                let event = match event {
                    Ok(BackendEvent::BucketCreated(name)) => ClusterEvent::BucketCreated { name },
                    Ok(BackendEvent::BucketDeleted(name)) => ClusterEvent::BucketDeleted { name },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Cluster feed lagged behind backend events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let Err(e) = self.apply(event) {
                    tracing::warn!(error = %e, "Cluster event rejected; keeping last snapshot");
                }
            }
            tracing::debug!("Cluster feed stopped following backend");
        })
    }
}

fn remove_node(state: &mut FeedState, node_id: &str) -> Result<(), ClusterFeedError> {
    let before = state.nodes.len();
    state.nodes.retain(|n| n.node_id != node_id);
    if state.nodes.len() == before {
        return Err(ClusterFeedError::UnknownNode(node_id.to_string()));
    }
    Ok(())
}

fn server_of(node: &NodeConfig) -> Server {
    let mut server = Server::new(&node.host_id, &node.node_id, &node.server_group);
    for service in &node.services {
        server = match service {
            NodeService::Mgmt => server.with_mgmt(),
            NodeService::Kv => server.with_kv(),
            NodeService::Views => server.with_views(),
            NodeService::Query => server.with_query(),
            NodeService::Analytics => server.with_analytics(),
            NodeService::Search => server.with_search(),
        };
    }
    server
}

/// Cluster snapshot plus one partition map per bucket.
fn build(
    state: &FeedState,
    num_vbuckets: u32,
    num_replicas: u32,
) -> Result<(Topology, Vec<(String, BucketTopology)>), ClusterFeedError> {
    let servers: Vec<Arc<Server>> = state.nodes.iter().map(|n| Arc::new(server_of(n))).collect();
    let cluster = Topology::new(state.rev_epoch, state.revision, servers.clone())?;

    let kv: Vec<&Arc<Server>> = servers.iter().filter(|s| s.has_kv).collect();
    if kv.is_empty() && !state.buckets.is_empty() {
        return Err(ClusterFeedError::NoDataNodes);
    }

    let n = kv.len() as u32;
    // A replica never lands on its primary.
    let replicas = num_replicas.min(n.saturating_sub(1));

    let mut buckets = Vec::with_capacity(state.buckets.len());
    for name in &state.buckets {
        let data_servers = kv
            .iter()
            .enumerate()
            .map(|(idx, server)| {
                let idx = idx as u32;
                let vbuckets = (0..num_vbuckets).filter(|v| v % n == idx).collect();
                let vbucket_replicas = (0..num_vbuckets)
                    .map(|v| {
                        (1..=replicas)
                            .find(|r| (v + r) % n == idx)
                            .map_or(-1, |r| r as i32)
                    })
                    .collect();
                DataServer::new((*server).clone(), vbuckets, vbucket_replicas)
            })
            .collect();

        let bucket = BucketTopology::new(
            state.rev_epoch,
            state.revision,
            num_vbuckets,
            servers.clone(),
            data_servers,
        )?;
        buckets.push((name.clone(), bucket));
    }

    Ok((cluster, buckets))
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterFeedError {
    #[error("Node already in cluster: {0}")]
    DuplicateNode(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Bucket already exists: {0}")]
    DuplicateBucket(String),

    #[error("Unknown bucket: {0}")]
    UnknownBucket(String),

    #[error("No kv-capable nodes left to own partitions")]
    NoDataNodes,

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgw_topology::{CacheUpdate, RoutingCache};

    fn config(nodes: &[&str], replicas: u32) -> ClusterConfig {
        ClusterConfig {
            nodes: nodes
                .iter()
                .map(|n| NodeConfig::new(n, &format!("{}:11210", n)))
                .collect(),
            buckets: vec!["default".to_string()],
            num_vbuckets: 8,
            num_replicas: replicas,
        }
    }

    #[test]
    fn test_round_robin_assignment() {
        let feed = ClusterFeed::new(&config(&["a", "b", "c"], 1)).unwrap();
        let bucket = feed.publisher().bucket("default").unwrap();

        assert_eq!(bucket.primary_for(0).unwrap().node_id, "a");
        assert_eq!(bucket.primary_for(1).unwrap().node_id, "b");
        assert_eq!(bucket.primary_for(5).unwrap().node_id, "c");

        let replicas: Vec<String> = bucket
            .replicas_for(0)
            .into_iter()
            .map(|s| s.node_id.clone())
            .collect();
        assert_eq!(replicas, vec!["b".to_string()]);
    }

    #[test]
    fn test_single_node_has_no_replicas() {
        let feed = ClusterFeed::new(&config(&["a"], 2)).unwrap();
        let bucket = feed.publisher().bucket("default").unwrap();
        assert!((0..8).all(|v| bucket.replicas_for(v).is_empty()));
    }

    #[test]
    fn test_node_added_bumps_revision() {
        let feed = ClusterFeed::new(&config(&["a"], 1)).unwrap();
        feed.apply(ClusterEvent::NodeAdded(NodeConfig::new("b", "b:11210")))
            .unwrap();

        let cluster = feed.publisher().current();
        assert_eq!((cluster.rev_epoch(), cluster.revision()), (0, 1));
        assert_eq!(cluster.servers().len(), 2);

        let bucket = feed.publisher().bucket("default").unwrap();
        assert_eq!(bucket.primary_for(1).unwrap().node_id, "b");
    }

    #[test]
    fn test_failover_starts_new_epoch_and_resets_cache() {
        let feed = ClusterFeed::new(&config(&["a", "b"], 1)).unwrap();
        let mut cache = RoutingCache::new();
        cache.apply(feed.publisher().bucket("default").unwrap());
        assert_eq!(cache.route(1), Some("b"));

        feed.apply(ClusterEvent::Failover { node_id: "b".into() })
            .unwrap();

        let bucket = feed.publisher().bucket("default").unwrap();
        assert_eq!((bucket.rev_epoch(), bucket.revision()), (1, 0));
        assert_eq!(cache.apply(bucket), CacheUpdate::Reset);
        assert_eq!(cache.route(1), Some("a"));
    }

    #[test]
    fn test_rejected_event_keeps_snapshot() {
        let feed = ClusterFeed::new(&config(&["a"], 1)).unwrap();

        let err = feed
            .apply(ClusterEvent::Failover { node_id: "a".into() })
            .unwrap_err();
        assert!(matches!(err, ClusterFeedError::NoDataNodes));

        let err = feed
            .apply(ClusterEvent::NodeRemoved { node_id: "zz".into() })
            .unwrap_err();
        assert!(matches!(err, ClusterFeedError::UnknownNode(_)));

        let bucket = feed.publisher().bucket("default").unwrap();
        assert_eq!((bucket.rev_epoch(), bucket.revision()), (0, 0));
        assert_eq!(bucket.primary_for(0).unwrap().node_id, "a");
    }

    #[test]
    fn test_bucket_lifecycle() {
        let feed = ClusterFeed::new(&config(&["a", "b"], 1)).unwrap();
        let publisher = feed.publisher();

        feed.apply(ClusterEvent::BucketCreated { name: "travel".into() })
            .unwrap();
        let travel = publisher.bucket("travel").unwrap();
        assert_eq!((travel.rev_epoch(), travel.revision()), (0, 1));
        assert_eq!(publisher.bucket("default").unwrap().revision(), 1);

        assert!(matches!(
            feed.apply(ClusterEvent::BucketCreated { name: "travel".into() }),
            Err(ClusterFeedError::DuplicateBucket(_))
        ));

        feed.apply(ClusterEvent::BucketDeleted { name: "travel".into() })
            .unwrap();
        assert!(publisher.bucket("travel").is_none());
        assert_eq!(feed.bucket_names(), vec!["default".to_string()]);

        // Recreated under the same name, above the version it was deleted at.
        feed.apply(ClusterEvent::BucketCreated { name: "travel".into() })
            .unwrap();
        assert_eq!(publisher.bucket("travel").unwrap().revision(), 3);
    }

    #[test]
    fn test_conflicting_bucket_publishes_nothing_and_feed_keeps_going() {
        let feed = ClusterFeed::new(&config(&["a", "b"], 1)).unwrap();
        let publisher = feed.publisher();

        // Someone else already published "travel" at the version the next
        // event would produce.
        let mut ahead = feed.state.lock().clone();
        ahead.revision = 1;
        let (_, mut buckets) = build(&ahead, 8, 1).unwrap();
        let (_, travel) = buckets.remove(0);
        publisher.publish_bucket("travel", travel).unwrap();

        let err = feed
            .apply(ClusterEvent::BucketCreated { name: "travel".into() })
            .unwrap_err();
        assert!(matches!(err, ClusterFeedError::Topology(TopologyError::OutOfOrder { .. })));
        assert_eq!((publisher.current().rev_epoch(), publisher.current().revision()), (0, 0));
        assert_eq!(publisher.bucket("default").unwrap().revision(), 0);
        assert_eq!(feed.bucket_names(), vec!["default".to_string()]);

        feed.apply(ClusterEvent::NodeAdded(NodeConfig::new("c", "c:11210")))
            .unwrap();
        assert_eq!((publisher.current().rev_epoch(), publisher.current().revision()), (0, 1));
        assert_eq!(publisher.bucket("default").unwrap().revision(), 1);
    }

    #[tokio::test]
    async fn test_follows_backend_bucket_events() {
        use sgw_transport_grpc::backend::{BucketSettings, ClusterBackend};

        let feed = Arc::new(ClusterFeed::new(&config(&["a"], 0)).unwrap());
        let backend = MemoryBackend::with_buckets(8, ["default"]);
        let cancel = CancellationToken::new();
        let task = feed.clone().follow(&backend, cancel.clone());

        backend
            .create_bucket(BucketSettings {
                name: "beer".into(),
                ram_quota_mb: 100,
                num_replicas: 0,
                flush_enabled: false,
            })
            .await
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while feed.publisher().bucket("beer").is_none() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(feed.bucket_names(), vec!["beer".to_string(), "default".to_string()]);

        cancel.cancel();
        task.await.unwrap();
    }
}
