//! End-to-end tests over real sockets: both planes, the interceptor chain,
//! and the serve/shutdown lifecycle.

use bytes::Bytes;
use sgw_topology::{
    BucketTopology, CacheUpdate, DataServer, RoutingCache, Server, Topology, TopologyPublisher,
};
use sgw_transport_grpc::backend::{
    BackendError, BucketSettings, ClusterBackend, DocumentId, GetResult, MemoryBackend,
    MutationResult, QueryIndex, RemoveOptions, ScopeSpec, SearchIndex, UpsertOptions,
};
use sgw_transport_grpc::interceptor::metrics::GatewayMetrics;
use sgw_transport_grpc::interceptor::CallKind;
use sgw_transport_grpc::proto::health::{health_client::HealthClient, HealthCheckRequest};
use sgw_transport_grpc::proto::hooks::{
    hook, hooks_client::HooksClient, AddHooksRequest, CreateHooksContextRequest, Hook,
    ReturnErrorAction,
};
use sgw_transport_grpc::proto::kv::{kv_client::KvClient, GetRequest, UpsertRequest};
use sgw_transport_grpc::proto::routing::{
    routing_client::RoutingClient, GetRoutingRequest, WatchRoutingRequest,
};
use sgw_transport_grpc::routing::decode_bucket;
use sgw_transport_grpc::{Listeners, System, SystemError, SystemOptions};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::{Code, Request};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Memory backend whose `get` panics for the key "panic".
struct PanickingBackend {
    inner: MemoryBackend,
}

#[async_trait::async_trait]
impl ClusterBackend for PanickingBackend {
    async fn get(&self, id: &DocumentId) -> Result<GetResult, BackendError> {
        if id.key == "panic" {
            panic!("backend driver crashed");
        }
        self.inner.get(id).await
    }
    async fn upsert(&self, id: &DocumentId, content: Bytes, opts: UpsertOptions) -> Result<MutationResult, BackendError> {
        self.inner.upsert(id, content, opts).await
    }
    async fn remove(&self, id: &DocumentId, opts: RemoveOptions) -> Result<MutationResult, BackendError> {
        self.inner.remove(id, opts).await
    }
    async fn touch(&self, id: &DocumentId, expiry: Duration) -> Result<MutationResult, BackendError> {
        self.inner.touch(id, expiry).await
    }
    async fn list_buckets(&self) -> Result<Vec<BucketSettings>, BackendError> {
        self.inner.list_buckets().await
    }
    async fn create_bucket(&self, settings: BucketSettings) -> Result<(), BackendError> {
        self.inner.create_bucket(settings).await
    }
    async fn delete_bucket(&self, name: &str) -> Result<(), BackendError> {
        self.inner.delete_bucket(name).await
    }
    async fn list_scopes(&self, bucket: &str) -> Result<Vec<ScopeSpec>, BackendError> {
        self.inner.list_scopes(bucket).await
    }
    async fn create_collection(&self, bucket: &str, scope: &str, collection: &str) -> Result<(), BackendError> {
        self.inner.create_collection(bucket, scope, collection).await
    }
    async fn delete_collection(&self, bucket: &str, scope: &str, collection: &str) -> Result<(), BackendError> {
        self.inner.delete_collection(bucket, scope, collection).await
    }
    async fn list_search_indexes(&self) -> Result<Vec<SearchIndex>, BackendError> {
        self.inner.list_search_indexes().await
    }
    async fn upsert_search_index(&self, index: SearchIndex) -> Result<(), BackendError> {
        self.inner.upsert_search_index(index).await
    }
    async fn delete_search_index(&self, name: &str) -> Result<(), BackendError> {
        self.inner.delete_search_index(name).await
    }
    async fn list_query_indexes(&self, bucket: Option<&str>) -> Result<Vec<QueryIndex>, BackendError> {
        self.inner.list_query_indexes(bucket).await
    }
    async fn create_primary_index(&self, bucket: &str, name: Option<&str>, ignore_if_exists: bool) -> Result<(), BackendError> {
        self.inner.create_primary_index(bucket, name, ignore_if_exists).await
    }
    async fn begin_transaction(&self, bucket: &str) -> Result<String, BackendError> {
        self.inner.begin_transaction(bucket).await
    }
    async fn commit_transaction(&self, bucket: &str, id: &str) -> Result<(), BackendError> {
        self.inner.commit_transaction(bucket, id).await
    }
    async fn rollback_transaction(&self, bucket: &str, id: &str) -> Result<(), BackendError> {
        self.inner.rollback_transaction(bucket, id).await
    }
}

fn nodes(names: &[&str]) -> Vec<Arc<Server>> {
    names
        .iter()
        .map(|n| Arc::new(Server::new(format!("{}:11210", n), *n, "rack-a").with_kv()))
        .collect()
}

/// Four vbuckets; `owners[v]` is the node owning vbucket `v`.
fn bucket(epoch: u64, rev: u64, owners: [&str; 4]) -> BucketTopology {
    let servers = nodes(&["a", "b"]);
    let data_servers = servers
        .iter()
        .map(|s| {
            let vbuckets = owners
                .iter()
                .enumerate()
                .filter(|(_, o)| **o == s.node_id)
                .map(|(v, _)| v as u32)
                .collect();
            DataServer::new(s.clone(), vbuckets, vec![-1; 4])
        })
        .collect();
    BucketTopology::new(epoch, rev, 4, servers, data_servers).unwrap()
}

struct Gateway {
    system: Arc<System>,
    publisher: Arc<TopologyPublisher>,
    cancel: CancellationToken,
    serve: JoinHandle<Result<(), SystemError>>,
    data: SocketAddr,
    sd: Option<SocketAddr>,
}

impl Gateway {
    async fn start(with_sd: bool, configure: impl FnOnce(&mut SystemOptions)) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let publisher = Arc::new(TopologyPublisher::new(Topology::new(0, 0, nodes(&["a", "b"])).unwrap()));
        publisher.publish_bucket("travel", bucket(0, 0, ["a", "b", "a", "b"])).unwrap();

        let backend = Arc::new(PanickingBackend {
            inner: MemoryBackend::with_buckets(4, ["travel"]),
        });
        let mut opts = SystemOptions::new(backend, publisher.clone());
        configure(&mut opts);
        let system = Arc::new(System::new(opts));

        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listeners = Listeners::bind(Some(loopback), with_sd.then_some(loopback))
            .await
            .unwrap();
        let data = listeners.data_addr().unwrap();
        let sd = listeners.sd_addr();

        let cancel = CancellationToken::new();
        let serve = {
            let system = system.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { system.serve(cancel, listeners).await })
        };

        Self {
            system,
            publisher,
            cancel,
            serve,
            data,
            sd,
        }
    }

    async fn channel(addr: SocketAddr) -> Channel {
        Channel::from_shared(format!("http://{}", addr))
            .unwrap()
            .connect()
            .await
            .unwrap()
    }

    async fn kv(&self) -> KvClient<Channel> {
        KvClient::new(Self::channel(self.data).await)
    }

    async fn routing(&self) -> RoutingClient<Channel> {
        RoutingClient::new(Self::channel(self.sd.unwrap()).await)
    }

    async fn stop(self) {
        self.cancel.cancel();
        tokio::time::timeout(TIMEOUT, self.serve)
            .await
            .expect("serve did not return after cancel")
            .unwrap()
            .unwrap();
    }
}

fn get(key: &str) -> GetRequest {
    GetRequest {
        bucket_name: "travel".into(),
        key: key.into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_watch_routing_across_failover() {
    let gw = Gateway::start(true, |_| {}).await;
    let mut routing = gw.routing().await;

    let mut stream = routing
        .watch_routing(WatchRoutingRequest {
            bucket_name: Some("travel".into()),
        })
        .await
        .unwrap()
        .into_inner();

    let mut cache = RoutingCache::new();
    let first = stream.message().await.unwrap().unwrap();
    assert_eq!((first.rev_epoch, first.revision), (0, 0));
    assert_eq!(cache.apply(Arc::new(decode_bucket(&first).unwrap())), CacheUpdate::Initialized);
    assert_eq!(cache.route(1), Some("b"));

    // Node b fails over: new epoch, a owns everything.
    gw.publisher
        .publish_bucket("travel", bucket(1, 0, ["a", "a", "a", "a"]))
        .unwrap();

    let second = tokio::time::timeout(TIMEOUT, stream.message())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!((second.rev_epoch, second.revision), (1, 0));
    assert_eq!(cache.apply(Arc::new(decode_bucket(&second).unwrap())), CacheUpdate::Reset);
    assert_eq!(cache.route(1), Some("a"));

    gw.stop().await;
}

#[tokio::test]
async fn test_watch_ended_by_bucket_removal_is_counted_with_its_status() {
    const WATCH: &str = "/sgw.routing.v1.Routing/WatchRouting";
    let metrics = Arc::new(GatewayMetrics::new());
    let gw = {
        let metrics = metrics.clone();
        Gateway::start(true, move |opts| opts.metrics = metrics).await
    };
    let mut routing = gw.routing().await;

    let mut stream = routing
        .watch_routing(WatchRoutingRequest {
            bucket_name: Some("travel".into()),
        })
        .await
        .unwrap()
        .into_inner();
    stream.message().await.unwrap().unwrap();
    assert_eq!(metrics.in_flight("sd", WATCH, CallKind::Streaming), 1);

    assert!(gw.publisher.remove_bucket("travel"));
    let err = tokio::time::timeout(TIMEOUT, stream.message())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    assert_eq!(metrics.calls_total("sd", WATCH, CallKind::Streaming, Code::NotFound), 1);
    assert_eq!(metrics.calls_total("sd", WATCH, CallKind::Streaming, Code::Ok), 0);
    assert_eq!(metrics.in_flight("sd", WATCH, CallKind::Streaming), 0);

    drop(stream);
    drop(routing);
    gw.stop().await;
}

#[tokio::test]
async fn test_get_routing_unknown_bucket() {
    let gw = Gateway::start(true, |_| {}).await;
    let mut routing = gw.routing().await;

    let cluster = routing
        .get_routing(GetRoutingRequest { bucket_name: None })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(cluster.servers.len(), 2);

    let err = routing
        .get_routing(GetRoutingRequest {
            bucket_name: Some("nope".into()),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    gw.stop().await;
}

#[tokio::test]
async fn test_handler_panic_returns_internal_and_planes_keep_serving() {
    let gw = Gateway::start(true, |_| {}).await;
    let mut kv = gw.kv().await;

    let err = kv.get(get("panic")).await.unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(err.message(), "An internal error occurred.");

    // Same connection, same plane.
    let err = kv.get(get("missing")).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    // Other plane.
    let mut routing = gw.routing().await;
    routing
        .get_routing(GetRoutingRequest { bucket_name: None })
        .await
        .unwrap();

    gw.stop().await;
}

#[tokio::test]
async fn test_invalid_durability_is_invalid_argument() {
    let gw = Gateway::start(true, |_| {}).await;
    let mut kv = gw.kv().await;

    let err = kv
        .upsert(UpsertRequest {
            bucket_name: "travel".into(),
            key: "doc".into(),
            content: b"{}".to_vec(),
            durability_level: Some(17),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    gw.stop().await;
}

#[tokio::test]
async fn test_hooks_short_circuit_tagged_calls() {
    let gw = Gateway::start(true, |_| {}).await;
    let mut hooks = HooksClient::new(Gateway::channel(gw.data).await);

    hooks
        .create_hooks_context(CreateHooksContextRequest { id: "suite-1".into() })
        .await
        .unwrap();
    hooks
        .add_hooks(AddHooksRequest {
            hooks_context_id: "suite-1".into(),
            hooks: vec![Hook {
                name: "kv-down".into(),
                target_method: "/sgw.kv.v1.Kv/Get".into(),
                action: Some(hook::Action::ReturnError(ReturnErrorAction {
                    code: Code::Unavailable as i32,
                    message: "injected outage".into(),
                })),
                max_invocations: Some(1),
            }],
        })
        .await
        .unwrap();

    let mut kv = gw.kv().await;
    let mut tagged = Request::new(get("doc"));
    tagged
        .metadata_mut()
        .insert("x-hooks-id", "suite-1".parse().unwrap());
    let err = kv.get(tagged).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(err.message(), "injected outage");

    // Budget used up: the call reaches the handler.
    let mut tagged = Request::new(get("doc"));
    tagged
        .metadata_mut()
        .insert("x-hooks-id", "suite-1".parse().unwrap());
    assert_eq!(kv.get(tagged).await.unwrap_err().code(), Code::NotFound);

    gw.stop().await;
}

#[tokio::test]
async fn test_oversized_message_is_rejected() {
    let gw = Gateway::start(true, |opts| opts.max_message_size = 1024).await;
    let mut kv = gw.kv().await;

    let err = kv
        .upsert(UpsertRequest {
            bucket_name: "travel".into(),
            key: "big".into(),
            content: vec![b'x'; 4096],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::OutOfRange);

    gw.stop().await;
}

#[tokio::test]
async fn test_data_plane_alone_serves_and_stops() {
    let gw = Gateway::start(false, |_| {}).await;
    assert!(gw.sd.is_none());

    let mut health = HealthClient::new(Gateway::channel(gw.data).await);
    let resp = health
        .check(HealthCheckRequest {
            service: "sgw.kv.v1.Kv".into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(resp.status, 1);

    gw.stop().await;
}

#[tokio::test]
async fn test_graceful_shutdown_ends_streams() {
    let gw = Gateway::start(true, |_| {}).await;
    let mut routing = gw.routing().await;
    let mut stream = routing
        .watch_routing(WatchRoutingRequest { bucket_name: None })
        .await
        .unwrap()
        .into_inner();
    stream.message().await.unwrap().unwrap();

    let system = gw.system.clone();
    let shutdown = tokio::spawn(async move { system.shutdown().await });

    // The watch ends without another snapshot.
    let next = tokio::time::timeout(TIMEOUT, stream.message()).await.unwrap();
    assert!(matches!(next, Ok(None) | Err(_)));

    drop(stream);
    drop(routing);
    tokio::time::timeout(TIMEOUT, shutdown).await.unwrap().unwrap();
    tokio::time::timeout(TIMEOUT, gw.serve)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        gw.system.health().status(),
        sgw_transport_grpc::proto::health::health_check_response::ServingStatus::NotServing
    );
}
