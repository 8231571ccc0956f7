//! One listener's worth of routed services.
//!
//! A plane is the set of gRPC services reachable on one listener plus the
//! layer stack every call on it passes through:
//!
//! ```text
//! InterceptorLayer -> HardStopLayer -> RecoveryLayer -> routes
//! ```

use crate::interceptor::{status_response, CallKind, InterceptorChain, InterceptorLayer, Plane};
use crate::recovery::RecoveryLayer;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::body::BoxBody;
use tonic::server::NamedService;
use tonic::service::{Routes, RoutesBuilder};
use tonic::transport::{Server, ServerTlsConfig};
use tonic::Status;
use tower::{Layer, Service, ServiceBuilder};

/// How long a hard-stopped plane may take to wind down its connections.
const HARD_STOP_GRACE: Duration = Duration::from_secs(5);

/// Collects the services of one plane.
pub struct PlaneBuilder {
    plane: Plane,
    routes: RoutesBuilder,
    service_names: Vec<&'static str>,
    methods: HashMap<String, CallKind>,
}

impl PlaneBuilder {
    pub fn new(plane: Plane) -> Self {
        Self {
            plane,
            routes: RoutesBuilder::default(),
            service_names: Vec::new(),
            methods: HashMap::new(),
        }
    }

    /// Register a service whose methods are all unary.
    pub fn add_service<S>(&mut self, svc: S, methods: &[&str]) -> &mut Self
    where
        S: Service<http::Request<BoxBody>, Response = http::Response<BoxBody>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        self.add_streaming_service(svc, methods, &[])
    }

    /// Register a service by its unary and server-streaming method names
    /// (e.g. `"WatchRouting"`). Calls to any other path on the plane are
    /// observed under a single unknown-method label.
    pub fn add_streaming_service<S>(&mut self, svc: S, unary: &[&str], streaming: &[&str]) -> &mut Self
    where
        S: Service<http::Request<BoxBody>, Response = http::Response<BoxBody>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        let shapes = unary
            .iter()
            .map(|m| (m, CallKind::Unary))
            .chain(streaming.iter().map(|m| (m, CallKind::Streaming)));
        for (method, kind) in shapes {
            self.methods.insert(format!("/{}/{}", S::NAME, method), kind);
        }
        self.service_names.push(S::NAME);
        self.routes.add_service(svc);
        self
    }

    /// Fully-qualified names of the services registered so far.
    pub fn service_names(&self) -> &[&'static str] {
        &self.service_names
    }

    /// Registered full method paths and their call shapes.
    pub fn methods(&self) -> &HashMap<String, CallKind> {
        &self.methods
    }

    /// Finish the plane. `hard_stop` aborts its in-flight calls and
    /// `draining` stops it accepting new connections.
    pub fn build(
        self,
        chain: Arc<InterceptorChain>,
        hard_stop: CancellationToken,
        draining: CancellationToken,
    ) -> PlaneRoutes {
        PlaneRoutes {
            interceptors: InterceptorLayer::new(self.plane, chain, self.methods),
            plane: self.plane,
            routes: self.routes.routes(),
            service_names: self.service_names,
            hard_stop,
            draining,
        }
    }
}

/// A built plane, ready to serve on a listener.
pub struct PlaneRoutes {
    plane: Plane,
    routes: Routes,
    interceptors: InterceptorLayer,
    service_names: Vec<&'static str>,
    hard_stop: CancellationToken,
    draining: CancellationToken,
}

impl PlaneRoutes {
    pub fn plane(&self) -> Plane {
        self.plane
    }

    pub fn service_names(&self) -> &[&'static str] {
        &self.service_names
    }

    /// Serve until drained or hard-stopped.
    pub async fn serve(
        self,
        listener: TcpListener,
        tls: Option<ServerTlsConfig>,
    ) -> Result<(), tonic::transport::Error> {
        let plane = self.plane;
        let stack = ServiceBuilder::new()
            .layer(self.interceptors)
            .layer(HardStopLayer::new(self.hard_stop.clone()))
            .layer(RecoveryLayer)
            .into_inner();

        let mut builder = Server::builder();
        if let Some(tls) = tls {
            builder = builder.tls_config(tls)?;
        }

        let draining = self.draining.clone();
        let server = builder
            .layer(stack)
            .add_routes(self.routes)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                draining.cancelled().await;
            });
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => result,
            _ = self.hard_stop.cancelled() => {
                match tokio::time::timeout(HARD_STOP_GRACE, &mut server).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(plane = %plane, "Plane did not wind down after hard stop; abandoning connections");
                        Ok(())
                    }
                }
            }
        }
    }
}

/// Fails new and in-flight calls with `Unavailable` once the stop token
/// fires.
#[derive(Debug, Clone)]
pub struct HardStopLayer {
    stop: CancellationToken,
}

impl HardStopLayer {
    pub fn new(stop: CancellationToken) -> Self {
        Self { stop }
    }
}

impl<S> Layer<S> for HardStopLayer {
    type Service = HardStopService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HardStopService {
            inner,
            stop: self.stop.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HardStopService<S> {
    inner: S,
    stop: CancellationToken,
}

impl<S, ReqBody> Service<http::Request<ReqBody>> for HardStopService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let stop = self.stop.clone();

        Box::pin(async move {
            if stop.is_cancelled() {
                return Ok(status_response(stopping()));
            }
            tokio::select! {
                result = inner.call(req) => result,
                _ = stop.cancelled() => Ok(status_response(stopping())),
            }
        })
    }
}

fn stopping() -> Status {
    Status::unavailable("gateway is shutting down")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    #[derive(Clone)]
    struct Slow;

    impl Service<http::Request<()>> for Slow {
        type Response = http::Response<BoxBody>;
        type Error = Infallible;
        type Future = BoxFuture<'static, Result<Self::Response, Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: http::Request<()>) -> Self::Future {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(http::Response::new(tonic::body::empty_body()))
            })
        }
    }

    fn request() -> http::Request<()> {
        http::Request::builder().uri("/pkg.Svc/Slow").body(()).unwrap()
    }

    #[test]
    fn test_registered_methods_carry_call_shape() {
        use crate::health::{HealthReporter, HealthService};
        use crate::hooks::{HooksManager, HooksService};
        use crate::proto::health::health_server::HealthServer;
        use crate::proto::hooks::hooks_server::HooksServer;

        let mut plane = PlaneBuilder::new(Plane::Data);
        plane
            .add_service(
                HooksServer::new(HooksService::new(Arc::new(HooksManager::new()))),
                &["AddHooks"],
            )
            .add_streaming_service(
                HealthServer::new(HealthService::new(
                    HealthReporter::new(),
                    Vec::new(),
                    CancellationToken::new(),
                )),
                &["Check"],
                &["Watch"],
            );

        assert_eq!(
            plane.service_names(),
            &["sgw.internal_hooks.v1.Hooks", "grpc.health.v1.Health"]
        );
        let methods = plane.methods();
        assert_eq!(methods.len(), 3);
        assert_eq!(methods["/sgw.internal_hooks.v1.Hooks/AddHooks"], CallKind::Unary);
        assert_eq!(methods["/grpc.health.v1.Health/Check"], CallKind::Unary);
        assert_eq!(methods["/grpc.health.v1.Health/Watch"], CallKind::Streaming);
        assert!(!methods.contains_key("/grpc.health.v1.Health/Bogus"));
    }

    #[tokio::test]
    async fn test_hard_stop_aborts_in_flight_call() {
        let stop = CancellationToken::new();
        let svc = HardStopLayer::new(stop.clone()).layer(Slow);

        let call = tokio::spawn(svc.oneshot(request()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.cancel();

        let response = call.await.unwrap().unwrap();
        let status = Status::from_header_map(response.headers()).unwrap();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn test_hard_stop_rejects_new_calls() {
        let stop = CancellationToken::new();
        stop.cancel();
        let response = HardStopLayer::new(stop).layer(Slow).oneshot(request()).await.unwrap();
        let status = Status::from_header_map(response.headers()).unwrap();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }
}
