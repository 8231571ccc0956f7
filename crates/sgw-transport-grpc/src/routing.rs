//! Routing service.
//!
//! Serves topology snapshots on the service-discovery plane, either polled
//! (GetRouting) or streamed (WatchRouting). Each watch call runs one
//! forwarding task that emits only strictly newer versions.

use crate::proto::routing::{
    routing_server::Routing, DataRoutingServer, GetRoutingRequest, RoutingServer,
    RoutingSnapshot, VbucketRouting, WatchRoutingRequest,
};
use crate::recovery::spawn_producer;
use sgw_topology::{
    BucketTopology, DataServer, Server, Topology, TopologyError, TopologyPublisher,
    TopologyVersion, Versioned,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

const WATCH_BUFFER: usize = 4;
const WATCH_METHOD: &str = "/sgw.routing.v1.Routing/WatchRouting";

pub struct RoutingService {
    publisher: Arc<TopologyPublisher>,
    draining: CancellationToken,
}

impl RoutingService {
    /// `draining` ends every open watch stream when cancelled.
    pub fn new(publisher: Arc<TopologyPublisher>, draining: CancellationToken) -> Self {
        Self {
            publisher,
            draining,
        }
    }
}

#[tonic::async_trait]
impl Routing for RoutingService {
    async fn get_routing(
        &self,
        request: Request<GetRoutingRequest>,
    ) -> Result<Response<RoutingSnapshot>, Status> {
        let snapshot = match request.into_inner().bucket_name {
            None => encode_topology(&self.publisher.current()),
            Some(name) => {
                let bucket = self.publisher.bucket(&name).ok_or_else(|| unknown_bucket(&name))?;
                encode_bucket(&name, &bucket)
            }
        };
        Ok(Response::new(snapshot))
    }

    type WatchRoutingStream = ReceiverStream<Result<RoutingSnapshot, Status>>;

    async fn watch_routing(
        &self,
        request: Request<WatchRoutingRequest>,
    ) -> Result<Response<Self::WatchRoutingStream>, Status> {
        let stream = match request.into_inner().bucket_name {
            None => {
                tracing::debug!("Routing watch opened for cluster");
                spawn_watch(
                    self.publisher.subscribe(),
                    self.draining.clone(),
                    None,
                    |t: &Topology| encode_topology(t),
                )
            }
            Some(name) => {
                let rx = self
                    .publisher
                    .subscribe_bucket(&name)
                    .ok_or_else(|| unknown_bucket(&name))?;
                tracing::debug!(bucket = %name, "Routing watch opened for bucket");
                spawn_watch(
                    rx,
                    self.draining.clone(),
                    Some(unknown_bucket(&name)),
                    move |b: &BucketTopology| encode_bucket(&name, b),
                )
            }
        };
        Ok(Response::new(stream))
    }
}

fn unknown_bucket(name: &str) -> Status {
    Status::not_found(format!("Unknown bucket: {}", name))
}

/// Forward snapshots from `rx` until the client goes away, the plane drains,
/// or the sender is dropped (then `on_closed` is sent, if any).
fn spawn_watch<T, F>(
    mut rx: watch::Receiver<Arc<T>>,
    draining: CancellationToken,
    mut on_closed: Option<Status>,
    encode: F,
) -> ReceiverStream<Result<RoutingSnapshot, Status>>
where
    T: Versioned + Send + Sync + 'static,
    F: Fn(&T) -> RoutingSnapshot + Send + 'static,
{
    let (tx, out) = mpsc::channel(WATCH_BUFFER);

    spawn_producer(WATCH_METHOD, tx, move |tx| async move {
        let mut last: Option<TopologyVersion> = None;
        loop {
            let snapshot = rx.borrow_and_update().clone();
            let version = snapshot.version();
            if last.map_or(true, |seen| version > seen) {
                tokio::select! {
                    sent = tx.send(Ok(encode(&snapshot))) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                    _ = draining.cancelled() => return,
                }
                last = Some(version);
            }

            tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!("Routing watch closed by client");
                    return;
                }
                _ = draining.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        if let Some(status) = on_closed.take() {
                            let _ = tx.send(Err(status)).await;
                        }
                        return;
                    }
                }
            }
        }
    });

    ReceiverStream::new(out)
}

fn encode_server(server: &Server) -> RoutingServer {
    RoutingServer {
        host_id: server.host_id.clone(),
        node_id: server.node_id.clone(),
        server_group: server.server_group.clone(),
        has_mgmt: server.has_mgmt,
        has_kv: server.has_kv,
        has_views: server.has_views,
        has_query: server.has_query,
        has_analytics: server.has_analytics,
        has_search: server.has_search,
    }
}

fn decode_server(server: &RoutingServer) -> Server {
    Server {
        host_id: server.host_id.clone(),
        node_id: server.node_id.clone(),
        server_group: server.server_group.clone(),
        has_mgmt: server.has_mgmt,
        has_kv: server.has_kv,
        has_views: server.has_views,
        has_query: server.has_query,
        has_analytics: server.has_analytics,
        has_search: server.has_search,
    }
}

pub fn encode_topology(topology: &Topology) -> RoutingSnapshot {
    RoutingSnapshot {
        rev_epoch: topology.rev_epoch(),
        revision: topology.revision(),
        servers: topology.servers().iter().map(|s| encode_server(s)).collect(),
        vbucket_routing: None,
        bucket_name: None,
    }
}

pub fn encode_bucket(name: &str, bucket: &BucketTopology) -> RoutingSnapshot {
    let servers = bucket.servers();
    let data_servers = bucket
        .data_servers()
        .iter()
        .filter_map(|ds| {
            let idx = servers.iter().position(|s| s.node_id == ds.server.node_id)?;
            Some(DataRoutingServer {
                server_idx: idx as u32,
                vbuckets: ds.vbuckets.clone(),
                vbucket_replicas: ds.vbucket_replicas.clone(),
            })
        })
        .collect();

    RoutingSnapshot {
        rev_epoch: bucket.rev_epoch(),
        revision: bucket.revision(),
        servers: servers.iter().map(|s| encode_server(s)).collect(),
        vbucket_routing: Some(VbucketRouting {
            num_vbuckets: bucket.num_vbuckets(),
            data_servers,
        }),
        bucket_name: Some(name.to_string()),
    }
}

/// Rebuild a cluster snapshot received over the wire.
pub fn decode_topology(snapshot: &RoutingSnapshot) -> Result<Topology, TopologyError> {
    let servers = snapshot
        .servers
        .iter()
        .map(|s| Arc::new(decode_server(s)))
        .collect();
    Topology::new(snapshot.rev_epoch, snapshot.revision, servers)
}

/// Rebuild a bucket snapshot received over the wire, re-running validation.
pub fn decode_bucket(snapshot: &RoutingSnapshot) -> Result<BucketTopology, TopologyError> {
    let routing = snapshot
        .vbucket_routing
        .as_ref()
        .ok_or_else(|| TopologyError::Malformed("snapshot has no vbucket routing".into()))?;

    let servers: Vec<Arc<Server>> = snapshot
        .servers
        .iter()
        .map(|s| Arc::new(decode_server(s)))
        .collect();

    let data_servers = routing
        .data_servers
        .iter()
        .map(|ds| {
            let server = servers.get(ds.server_idx as usize).ok_or_else(|| {
                TopologyError::Malformed(format!("server index {} out of range", ds.server_idx))
            })?;
            Ok(DataServer::new(
                server.clone(),
                ds.vbuckets.clone(),
                ds.vbucket_replicas.clone(),
            ))
        })
        .collect::<Result<Vec<_>, TopologyError>>()?;

    BucketTopology::new(
        snapshot.rev_epoch,
        snapshot.revision,
        routing.num_vbuckets,
        servers,
        data_servers,
    )
}
