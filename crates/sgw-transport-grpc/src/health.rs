//! gRPC health service for the data plane.

use crate::proto::health::{
    health_check_response::ServingStatus, health_server::Health, HealthCheckRequest,
    HealthCheckResponse,
};
use crate::recovery::spawn_producer;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

/// Shared serving status for the gateway.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    status: Arc<watch::Sender<ServingStatus>>,
}

impl HealthReporter {
    pub fn new() -> Self {
        let (status, _) = watch::channel(ServingStatus::Serving);
        Self {
            status: Arc::new(status),
        }
    }

    pub fn status(&self) -> ServingStatus {
        *self.status.borrow()
    }

    pub fn set_serving(&self) {
        self.set(ServingStatus::Serving);
    }

    pub fn set_not_serving(&self) {
        self.set(ServingStatus::NotServing);
    }

    fn set(&self, next: ServingStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            tracing::info!(status = ?next, "Health status changed");
        }
    }

    fn subscribe(&self) -> watch::Receiver<ServingStatus> {
        self.status.subscribe()
    }
}

impl Default for HealthReporter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct HealthService {
    reporter: HealthReporter,
    /// Fully-qualified service names registered on the plane.
    services: HashSet<String>,
    draining: CancellationToken,
}

impl HealthService {
    pub fn new(
        reporter: HealthReporter,
        services: impl IntoIterator<Item = String>,
        draining: CancellationToken,
    ) -> Self {
        Self {
            reporter,
            services: services.into_iter().collect(),
            draining,
        }
    }

    fn check_service(&self, service: &str) -> Result<(), Status> {
        if service.is_empty() || self.services.contains(service) {
            Ok(())
        } else {
            Err(Status::not_found(format!("unknown service {}", service)))
        }
    }
}

#[tonic::async_trait]
impl Health for HealthService {
    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        self.check_service(&request.into_inner().service)?;
        Ok(Response::new(HealthCheckResponse {
            status: self.reporter.status() as i32,
        }))
    }

    type WatchStream = ReceiverStream<Result<HealthCheckResponse, Status>>;

    async fn watch(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        self.check_service(&request.into_inner().service)?;

        let mut rx = self.reporter.subscribe();
        let draining = self.draining.clone();
        let (tx, out) = mpsc::channel(4);

        spawn_producer("/grpc.health.v1.Health/Watch", tx, move |tx| async move {
            loop {
                let status = *rx.borrow_and_update();
                let response = HealthCheckResponse {
                    status: status as i32,
                };
                if tx.send(Ok(response)).await.is_err() {
                    return;
                }
                tokio::select! {
                    _ = tx.closed() => return,
                    _ = draining.cancelled() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(out)))
    }
}
