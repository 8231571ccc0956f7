//! HTTP side endpoint.
//!
//! Exposes health and metrics via HTTP for monitoring tools.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use sgw_transport_grpc::proto::health::health_check_response::ServingStatus;
use sgw_transport_grpc::{GatewayMetrics, HealthReporter};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// HTTP server state.
#[derive(Clone)]
pub struct HttpServerState {
    health: HealthReporter,
    metrics: Arc<GatewayMetrics>,
}

impl HttpServerState {
    pub fn new(health: HealthReporter, metrics: Arc<GatewayMetrics>) -> Self {
        Self { health, metrics }
    }
}

/// Routes:
/// - GET /health - gateway serving status
/// - GET /metrics - Prometheus metrics
pub fn router(state: HttpServerState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// HTTP server for the side endpoint.
pub struct HttpServer {
    addr: SocketAddr,
    state: HttpServerState,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    server_handle: Option<JoinHandle<Result<(), std::io::Error>>>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: HttpServerState) -> Self {
        Self {
            addr,
            state,
            local_addr: None,
            shutdown_tx: None,
            server_handle: None,
        }
    }

    /// Bind and start serving in the background.
    pub async fn start(&mut self) -> Result<(), HttpServerError> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| HttpServerError::Startup(format!("Failed to bind {}: {}", self.addr, e)))?;
        self.local_addr = listener.local_addr().ok();

        let app = router(self.state.clone());
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        self.server_handle = Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
        }));

        tracing::info!(addr = ?self.local_addr, "HTTP server started");
        Ok(())
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn shutdown(mut self) -> Result<(), HttpServerError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| HttpServerError::Shutdown(format!("Join error: {}", e)))?
                .map_err(|e| HttpServerError::Shutdown(format!("Server error: {}", e)))?;
        }

        tracing::info!("HTTP server shutdown complete");
        Ok(())
    }
}

/// GET /health
///
/// 200 while serving, 503 otherwise.
async fn health_handler(State(state): State<HttpServerState>) -> Response {
    let status = state.health.status();
    let code = if status == ServingStatus::Serving {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(serde_json::json!({ "status": status.as_str_name() }))).into_response()
}

/// GET /metrics
async fn metrics_handler(State(state): State<HttpServerState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(
                "content-type",
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http::Request;
    use tower::ServiceExt;

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_follows_reporter() {
        let health = HealthReporter::new();
        let app = router(HttpServerState::new(health.clone(), Arc::new(GatewayMetrics::new())));

        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["status"], "SERVING");

        health.set_not_serving();
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_exports_rpc_families() {
        let app = router(HttpServerState::new(HealthReporter::new(), Arc::new(GatewayMetrics::new())));

        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("sgw_rpc_calls"));
        assert!(body.contains("sgw_rpc_call_duration_seconds"));
        assert!(body.ends_with("# EOF\n"));
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let app = router(HttpServerState::new(HealthReporter::new(), Arc::new(GatewayMetrics::new())));
        let response = app.oneshot(get("/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
