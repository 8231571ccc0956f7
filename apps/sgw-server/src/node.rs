//! Gateway composition.
//!
//! Wires together the cluster feed, backend, gateway system and HTTP side
//! endpoint.

use crate::cluster_feed::{ClusterFeed, ClusterFeedError};
use crate::config::{ConfigError, GatewayConfig, TlsConfig};
use crate::http::{HttpServer, HttpServerError, HttpServerState};
use sgw_transport_grpc::backend::MemoryBackend;
use sgw_transport_grpc::{
    GatewayMetrics, HealthReporter, Listeners, System, SystemError, SystemOptions,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Identity, ServerTlsConfig};

/// Gateway process - main composition root.
///
/// Holds all components and manages their lifecycle.
pub struct Gateway {
    config: GatewayConfig,

    /// Topology source for the service-discovery plane
    feed: Arc<ClusterFeed>,

    /// Document store behind the data plane
    backend: Arc<MemoryBackend>,

    system: Arc<System>,
    metrics: Arc<GatewayMetrics>,
    health: HealthReporter,

    /// Stops the serve loop and the feed task
    cancel: CancellationToken,

    data_addr: Option<SocketAddr>,
    sd_addr: Option<SocketAddr>,

    serve_task: Option<JoinHandle<Result<(), SystemError>>>,
    feed_task: Option<JoinHandle<()>>,
    http_server: Option<HttpServer>,
}

impl Gateway {
    /// Create a gateway from configuration. Nothing is bound until
    /// [`Gateway::start`].
    pub async fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        config.validate()?;

        let feed = Arc::new(ClusterFeed::new(&config.cluster)?);
        let backend = Arc::new(MemoryBackend::with_buckets(
            config.cluster.num_vbuckets,
            feed.bucket_names(),
        ));

        let tls = match &config.tls {
            Some(tls) => Some(load_tls(tls).await?),
            None => None,
        };

        let metrics = Arc::new(GatewayMetrics::new());
        let health = HealthReporter::new();

        let mut opts = SystemOptions::new(backend.clone(), feed.publisher());
        opts.metrics = metrics.clone();
        opts.health = health.clone();
        opts.tls = tls;
        opts.debug = config.debug;
        opts.max_message_size = config.max_message_size;
        let system = Arc::new(System::new(opts));

        tracing::info!(
            buckets = ?feed.bucket_names(),
            tls = config.tls.is_some(),
            debug = config.debug,
            "Gateway initialized"
        );

        Ok(Self {
            config,
            feed,
            backend,
            system,
            metrics,
            health,
            cancel: CancellationToken::new(),
            data_addr: None,
            sd_addr: None,
            serve_task: None,
            feed_task: None,
            http_server: None,
        })
    }

    /// Bind listeners and start serving. On failure nothing is left
    /// running.
    pub async fn start(&mut self) -> Result<(), GatewayError> {
        tracing::info!("Starting gateway");

        let http_addr = self.config.http_socket_addr()?;
        let listeners = Listeners::bind(
            self.config.data_socket_addr()?,
            self.config.sd_socket_addr()?,
        )
        .await?;
        self.data_addr = listeners.data_addr();
        self.sd_addr = listeners.sd_addr();

        let system = self.system.clone();
        let cancel = self.cancel.clone();
        self.serve_task = Some(tokio::spawn(async move {
            system.serve(cancel, listeners).await
        }));
        tracing::info!(data = ?self.data_addr, sd = ?self.sd_addr, "Gateway planes started");

        self.feed_task = Some(self.feed.clone().follow(&self.backend, self.cancel.clone()));

        if let Some(addr) = http_addr {
            let mut http = HttpServer::new(
                addr,
                HttpServerState::new(self.health.clone(), self.metrics.clone()),
            );
            if let Err(e) = http.start().await {
                tracing::error!(error = %e, "HTTP endpoint failed to start; stopping planes");
                self.abort().await;
                return Err(e.into());
            }
            self.http_server = Some(http);
        }

        Ok(())
    }

    /// Hard-stop the planes and the feed and wait for both tasks.
    async fn abort(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.serve_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Serve loop failed while aborting"),
                Err(e) => tracing::warn!(error = %e, "Serve task failed while aborting"),
            }
        }
        if let Some(task) = self.feed_task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Feed task failed while aborting");
            }
        }
    }

    /// Resolves once the planes stop serving on their own, e.g. after
    /// [`System::shutdown`] or when every plane has failed. Never resolves
    /// if the gateway was not started.
    pub async fn stopped(&mut self) -> Result<(), GatewayError> {
        let Some(task) = self.serve_task.as_mut() else {
            return std::future::pending().await;
        };
        let result = task.await;
        self.serve_task = None;
        result.map_err(|e| GatewayError::Shutdown(format!("Serve task failed: {}", e)))??;
        Ok(())
    }

    /// Graceful shutdown: HTTP side endpoint, then both planes, then the feed.
    pub async fn shutdown(mut self) -> Result<(), GatewayError> {
        tracing::info!("Shutting down gateway");

        if let Some(http) = self.http_server.take() {
            http.shutdown().await?;
        }

        self.system.shutdown().await;
        if let Some(task) = self.serve_task.take() {
            task.await
                .map_err(|e| GatewayError::Shutdown(format!("Serve task failed: {}", e)))??;
        }

        self.cancel.cancel();
        if let Some(task) = self.feed_task.take() {
            task.await
                .map_err(|e| GatewayError::Shutdown(format!("Feed task failed: {}", e)))?;
        }

        tracing::info!("Gateway shutdown complete");
        Ok(())
    }

    pub fn data_addr(&self) -> Option<SocketAddr> {
        self.data_addr
    }

    pub fn sd_addr(&self) -> Option<SocketAddr> {
        self.sd_addr
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_server.as_ref().and_then(|h| h.local_addr())
    }

    pub fn feed(&self) -> &Arc<ClusterFeed> {
        &self.feed
    }

    pub fn system(&self) -> &Arc<System> {
        &self.system
    }
}

async fn load_tls(tls: &TlsConfig) -> Result<ServerTlsConfig, GatewayError> {
    let cert = tokio::fs::read(&tls.cert_path).await.map_err(|e| {
        GatewayError::Tls(format!("Failed to read {}: {}", tls.cert_path.display(), e))
    })?;
    let key = tokio::fs::read(&tls.key_path).await.map_err(|e| {
        GatewayError::Tls(format!("Failed to read {}: {}", tls.key_path.display(), e))
    })?;
    Ok(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ClusterFeed(#[from] ClusterFeedError),

    #[error(transparent)]
    System(#[from] SystemError),

    #[error(transparent)]
    Http(#[from] HttpServerError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),
}
