//! Smoke tests for sgw-server.
//!
//! Starts a gateway on ephemeral ports, exercises both planes and the HTTP
//! side endpoint, and shuts down cleanly.

use sgw_server::cluster_feed::ClusterEvent;
use sgw_server::config::{ClusterConfig, GatewayConfig, NodeConfig};
use sgw_server::node::Gateway;
use sgw_transport_grpc::proto::admin_bucket::{
    bucket_admin_client::BucketAdminClient, CreateBucketRequest,
};
use sgw_transport_grpc::proto::kv::{kv_client::KvClient, GetRequest, UpsertRequest};
use sgw_transport_grpc::proto::routing::{
    routing_client::RoutingClient, GetRoutingRequest, WatchRoutingRequest,
};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

fn config() -> GatewayConfig {
    GatewayConfig {
        data_addr: Some("127.0.0.1:0".to_string()),
        sd_addr: Some("127.0.0.1:0".to_string()),
        http_addr: Some("127.0.0.1:0".to_string()),
        cluster: ClusterConfig {
            nodes: vec![
                NodeConfig::new("node-a", "10.0.0.1:11210"),
                NodeConfig::new("node-b", "10.0.0.2:11210"),
            ],
            buckets: vec!["default".to_string()],
            num_vbuckets: 16,
            num_replicas: 1,
        },
        ..Default::default()
    }
}

async fn started() -> Gateway {
    tracing_subscriber::fmt()
        .with_test_writer()
        .try_init()
        .ok();

    let mut gateway = Gateway::new(config()).await.expect("Failed to create gateway");
    gateway.start().await.expect("Failed to start gateway");
    gateway
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test(flavor = "multi_thread")]
async fn test_gateway_lifecycle() {
    let gateway = started().await;
    let data = format!("http://{}", gateway.data_addr().unwrap());
    let sd = format!("http://{}", gateway.sd_addr().unwrap());

    // Data plane round trip.
    let mut kv = KvClient::connect(data.clone()).await.unwrap();
    let upserted = kv
        .upsert(UpsertRequest {
            bucket_name: "default".into(),
            key: "smoke_test_key".into(),
            content: b"{\"hello\":\"world\"}".to_vec(),
            ..Default::default()
        })
        .await
        .expect("Failed to upsert")
        .into_inner();
    assert!(upserted.mutation_token.is_some());

    let got = kv
        .get(GetRequest {
            bucket_name: "default".into(),
            key: "smoke_test_key".into(),
            ..Default::default()
        })
        .await
        .expect("Failed to get")
        .into_inner();
    assert_eq!(got.content, b"{\"hello\":\"world\"}".to_vec());
    assert_eq!(got.cas, upserted.cas);

    // Service-discovery plane.
    let mut routing = RoutingClient::connect(sd).await.unwrap();
    let snapshot = routing
        .get_routing(GetRoutingRequest {
            bucket_name: Some("default".into()),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!((snapshot.rev_epoch, snapshot.revision), (0, 0));
    assert_eq!(snapshot.vbucket_routing.unwrap().num_vbuckets, 16);

    // HTTP side endpoint.
    let http = gateway.http_addr().unwrap();
    let health = http_get(http, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200"), "{}", health);
    let metrics = http_get(http, "/metrics").await;
    assert!(metrics.contains("sgw_rpc_calls_total"), "{}", metrics);

    drop(kv);
    drop(routing);
    tokio::time::timeout(TIMEOUT, gateway.shutdown())
        .await
        .expect("Shutdown timed out")
        .expect("Shutdown failed");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_created_bucket_becomes_routable() {
    let gateway = started().await;
    let mut admin = BucketAdminClient::connect(format!("http://{}", gateway.data_addr().unwrap()))
        .await
        .unwrap();
    let mut routing = RoutingClient::connect(format!("http://{}", gateway.sd_addr().unwrap()))
        .await
        .unwrap();

    admin
        .create_bucket(CreateBucketRequest {
            bucket_name: "travel".into(),
            ram_quota_mb: 128,
            ..Default::default()
        })
        .await
        .unwrap();

    let snapshot = tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Ok(resp) = routing
                .get_routing(GetRoutingRequest {
                    bucket_name: Some("travel".into()),
                })
                .await
            {
                return resp.into_inner();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Bucket never became routable");
    assert_eq!((snapshot.rev_epoch, snapshot.revision), (0, 1));

    drop(admin);
    drop(routing);
    tokio::time::timeout(TIMEOUT, gateway.shutdown())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failover_reaches_watchers() {
    let gateway = started().await;
    let mut routing = RoutingClient::connect(format!("http://{}", gateway.sd_addr().unwrap()))
        .await
        .unwrap();

    let mut stream = routing
        .watch_routing(WatchRoutingRequest {
            bucket_name: Some("default".into()),
        })
        .await
        .unwrap()
        .into_inner();
    let first = stream.message().await.unwrap().unwrap();
    assert_eq!((first.rev_epoch, first.revision), (0, 0));

    gateway
        .feed()
        .apply(ClusterEvent::Failover {
            node_id: "node-b".into(),
        })
        .unwrap();

    let next = tokio::time::timeout(TIMEOUT, stream.message())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!((next.rev_epoch, next.revision), (1, 0));
    let routing_table = next.vbucket_routing.unwrap();
    assert_eq!(routing_table.data_servers.len(), 1);
    assert_eq!(routing_table.data_servers[0].vbuckets.len(), 16);

    drop(stream);
    drop(routing);
    tokio::time::timeout(TIMEOUT, gateway.shutdown())
        .await
        .unwrap()
        .unwrap();
}
