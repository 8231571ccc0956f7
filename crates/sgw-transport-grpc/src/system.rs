//! Gateway system: both planes, their shared interceptor policy, and the
//! serve/shutdown lifecycle.

use crate::backend::ClusterBackend;
use crate::dataimpl::DataServices;
use crate::health::{HealthReporter, HealthService};
use crate::hooks::{HooksManager, HooksService};
use crate::interceptor::metrics::GatewayMetrics;
use crate::interceptor::{InterceptorChain, Plane};
use crate::plane::{PlaneBuilder, PlaneRoutes};
use crate::proto::admin_bucket::bucket_admin_server::BucketAdminServer;
use crate::proto::admin_collection::collection_admin_server::CollectionAdminServer;
use crate::proto::admin_query::query_admin_server::QueryAdminServer;
use crate::proto::admin_search::search_admin_server::SearchAdminServer;
use crate::proto::analytics::analytics_server::AnalyticsServer;
use crate::proto::health::health_server::HealthServer;
use crate::proto::hooks::hooks_server::HooksServer;
use crate::proto::kv::kv_server::KvServer;
use crate::proto::query::query_server::QueryServer;
use crate::proto::routing::routing_server::RoutingServer;
use crate::proto::search::search_server::SearchServer;
use crate::proto::transactions::transactions_server::TransactionsServer;
use crate::routing::RoutingService;
use parking_lot::Mutex;
use sgw_topology::TopologyPublisher;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::ServerTlsConfig;

/// Default cap on inbound message size, in bytes.
pub const MAX_MSG_SIZE: usize = 25_000_000;

const HOOKS_METHODS: &[&str] = &["CreateHooksContext", "DestroyHooksContext", "AddHooks"];

/// Everything [`System::new`] needs.
pub struct SystemOptions {
    pub backend: Arc<dyn ClusterBackend>,
    pub topology: Arc<TopologyPublisher>,
    pub metrics: Arc<GatewayMetrics>,
    pub hooks: Arc<HooksManager>,
    pub health: HealthReporter,
    pub tls: Option<ServerTlsConfig>,
    /// Adds the debug interceptor to both chains.
    pub debug: bool,
    pub max_message_size: usize,
}

impl SystemOptions {
    pub fn new(backend: Arc<dyn ClusterBackend>, topology: Arc<TopologyPublisher>) -> Self {
        Self {
            backend,
            topology,
            metrics: Arc::new(GatewayMetrics::new()),
            hooks: Arc::new(HooksManager::new()),
            health: HealthReporter::new(),
            tls: None,
            debug: false,
            max_message_size: MAX_MSG_SIZE,
        }
    }
}

/// Listeners for the two planes. Either may be absent.
#[derive(Debug, Default)]
pub struct Listeners {
    pub data: Option<TcpListener>,
    pub sd: Option<TcpListener>,
}

impl Listeners {
    pub fn new(data: Option<TcpListener>, sd: Option<TcpListener>) -> Self {
        Self { data, sd }
    }

    /// Bind whichever addresses are given.
    pub async fn bind(data: Option<SocketAddr>, sd: Option<SocketAddr>) -> Result<Self, SystemError> {
        Ok(Self {
            data: bind_opt(data).await?,
            sd: bind_opt(sd).await?,
        })
    }

    pub fn data_addr(&self) -> Option<SocketAddr> {
        self.data.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn sd_addr(&self) -> Option<SocketAddr> {
        self.sd.as_ref().and_then(|l| l.local_addr().ok())
    }
}

async fn bind_opt(addr: Option<SocketAddr>) -> Result<Option<TcpListener>, SystemError> {
    match addr {
        None => Ok(None),
        Some(addr) => TcpListener::bind(addr)
            .await
            .map(Some)
            .map_err(|source| SystemError::Bind { addr, source }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("System is already serving")]
    AlreadyServing,
}

/// The gateway's two planes and their lifecycle.
pub struct System {
    data: Mutex<Option<PlaneRoutes>>,
    sd: Mutex<Option<PlaneRoutes>>,
    chain: Arc<InterceptorChain>,
    health: HealthReporter,
    tls: Option<ServerTlsConfig>,
    /// Aborts in-flight calls; parent of `draining`.
    hard_stop: CancellationToken,
    /// Stops accepting and ends open streams.
    draining: CancellationToken,
    tasks: TaskTracker,
}

impl System {
    pub fn new(opts: SystemOptions) -> Self {
        let chain = Arc::new(InterceptorChain::build(
            opts.metrics.clone(),
            opts.hooks.clone(),
            opts.debug,
        ));
        let hard_stop = CancellationToken::new();
        let draining = hard_stop.child_token();
        let max = opts.max_message_size;

        let data = DataServices::new(opts.backend.clone());
        let mut data_plane = PlaneBuilder::new(Plane::Data);
        data_plane
            .add_service(
                HooksServer::new(HooksService::new(opts.hooks.clone())).max_decoding_message_size(max),
                HOOKS_METHODS,
            )
            .add_service(
                KvServer::new(data.kv()).max_decoding_message_size(max),
                &["Get", "Upsert", "Remove", "Touch"],
            )
            .add_streaming_service(
                QueryServer::new(data.query()).max_decoding_message_size(max),
                &[],
                &["Query"],
            )
            .add_streaming_service(
                SearchServer::new(data.search()).max_decoding_message_size(max),
                &[],
                &["SearchQuery"],
            )
            .add_streaming_service(
                AnalyticsServer::new(data.analytics()).max_decoding_message_size(max),
                &[],
                &["AnalyticsQuery"],
            )
            .add_service(
                BucketAdminServer::new(data.bucket_admin()).max_decoding_message_size(max),
                &["ListBuckets", "CreateBucket", "DeleteBucket"],
            )
            .add_service(
                CollectionAdminServer::new(data.collection_admin()).max_decoding_message_size(max),
                &["ListCollections", "CreateCollection", "DeleteCollection"],
            )
            .add_service(
                SearchAdminServer::new(data.search_admin()).max_decoding_message_size(max),
                &["ListIndexes", "UpsertIndex", "DeleteIndex"],
            )
            .add_service(
                QueryAdminServer::new(data.query_admin()).max_decoding_message_size(max),
                &["GetAllIndexes", "CreatePrimaryIndex"],
            )
            .add_service(
                TransactionsServer::new(data.transactions()).max_decoding_message_size(max),
                &["BeginTransaction", "CommitTransaction", "RollbackTransaction"],
            );

        let mut health_services: Vec<String> =
            data_plane.service_names().iter().map(|s| s.to_string()).collect();
        health_services.push(<HealthServer<HealthService> as tonic::server::NamedService>::NAME.to_string());
        let health = HealthService::new(opts.health.clone(), health_services, draining.clone());
        data_plane.add_streaming_service(
            HealthServer::new(health).max_decoding_message_size(max),
            &["Check"],
            &["Watch"],
        );

        let mut sd_plane = PlaneBuilder::new(Plane::ServiceDiscovery);
        sd_plane
            .add_service(
                HooksServer::new(HooksService::new(opts.hooks.clone())).max_decoding_message_size(max),
                HOOKS_METHODS,
            )
            .add_streaming_service(
                RoutingServer::new(RoutingService::new(opts.topology.clone(), draining.clone()))
                    .max_decoding_message_size(max),
                &["GetRouting"],
                &["WatchRouting"],
            );

        tracing::info!(
            data_services = data_plane.service_names().len(),
            sd_services = sd_plane.service_names().len(),
            chain = ?chain,
            max_message_size = max,
            "Gateway system configured"
        );

        Self {
            data: Mutex::new(Some(data_plane.build(chain.clone(), hard_stop.clone(), draining.clone()))),
            sd: Mutex::new(Some(sd_plane.build(chain.clone(), hard_stop.clone(), draining.clone()))),
            chain,
            health: opts.health,
            tls: opts.tls,
            hard_stop,
            draining,
            tasks: TaskTracker::new(),
        }
    }

    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    pub fn health(&self) -> &HealthReporter {
        &self.health
    }

    /// Serve both planes until every serving task has stopped.
    ///
    /// Cancelling `cancel` hard-stops the system. A plane without a listener
    /// is skipped; a plane's transport error is logged and does not affect
    /// the other plane.
    pub async fn serve(&self, cancel: CancellationToken, listeners: Listeners) -> Result<(), SystemError> {
        let data = self.data.lock().take();
        let sd = self.sd.lock().take();
        let (Some(data), Some(sd)) = (data, sd) else {
            return Err(SystemError::AlreadyServing);
        };

        self.spawn_plane(data, listeners.data);
        self.spawn_plane(sd, listeners.sd);
        self.tasks.close();

        tokio::select! {
            _ = self.tasks.wait() => {}
            _ = cancel.cancelled() => {
                tracing::info!("Serve cancelled; stopping gateway");
                self.stop();
                self.tasks.wait().await;
            }
        }
        tracing::info!("Gateway stopped serving");
        Ok(())
    }

    fn spawn_plane(&self, plane: PlaneRoutes, listener: Option<TcpListener>) {
        let name = plane.plane();
        let Some(listener) = listener else {
            tracing::info!(plane = %name, "No listener configured; plane disabled");
            return;
        };
        let addr = listener.local_addr().ok();
        let tls = self.tls.clone();

        self.tasks.spawn(async move {
            tracing::info!(plane = %name, addr = ?addr, tls = tls.is_some(), "Plane serving");
            match plane.serve(listener, tls).await {
                Ok(()) => tracing::info!(plane = %name, "Plane stopped"),
                Err(e) => tracing::error!(plane = %name, error = %e, "Plane failed"),
            }
        });
    }

    /// Graceful shutdown: report NOT_SERVING, stop accepting, end open
    /// streams, and wait for in-flight calls to finish.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down gateway");
        self.health.set_not_serving();
        self.draining.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("Gateway shutdown complete");
    }

    /// Hard stop: like [`System::shutdown`] but in-flight calls are failed
    /// with `Unavailable`. Does not wait.
    pub fn stop(&self) {
        self.health.set_not_serving();
        self.hard_stop.cancel();
    }
}
