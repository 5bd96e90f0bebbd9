//! Health reporting and the `grpc.health.v1.Health` service.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::debug;

use super::pool::WorkerPool;
use super::proto::health_check_response::ServingStatus;
use super::proto::health_server::Health;
use super::proto::{HealthCheckRequest, HealthCheckResponse};
use super::shutdown::Shutdown;

/// Name the host pings to decide the plugin is alive.
pub const PLUGIN_SERVICE_NAME: &str = "plugin";

/// Status of a named service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Serving,
    NotServing,
    ServiceUnknown,
}

impl From<HealthStatus> for ServingStatus {
    fn from(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Unknown => ServingStatus::Unknown,
            HealthStatus::Serving => ServingStatus::Serving,
            HealthStatus::NotServing => ServingStatus::NotServing,
            HealthStatus::ServiceUnknown => ServingStatus::ServiceUnknown,
        }
    }
}

/// Shared, last-write-wins registry of service statuses.
#[derive(Clone)]
pub struct HealthReporter {
    statuses: Arc<watch::Sender<HashMap<String, HealthStatus>>>,
    shut_down: Arc<AtomicBool>,
}

impl HealthReporter {
    /// Create a reporter with the overall service (`""`) serving.
    pub fn new() -> Self {
        let mut statuses = HashMap::new();
        statuses.insert(String::new(), HealthStatus::Serving);
        let (tx, _) = watch::channel(statuses);
        Self {
            statuses: Arc::new(tx),
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Overwrite the status of `service`. Ignored after [`shutdown`](Self::shutdown).
    pub fn set_status(&self, service: &str, status: HealthStatus) {
        // Checked under the watch lock so a concurrent shutdown can't be undone
        self.statuses.send_if_modified(|map| {
            if self.shut_down.load(Ordering::Acquire) {
                return false;
            }
            map.insert(service.to_string(), status);
            true
        });
    }

    /// Last status set for `service`, or `ServiceUnknown`.
    pub fn check(&self, service: &str) -> HealthStatus {
        self.statuses
            .borrow()
            .get(service)
            .copied()
            .unwrap_or(HealthStatus::ServiceUnknown)
    }

    pub fn clear_status(&self, service: &str) {
        self.statuses.send_modify(|map| {
            map.remove(service);
        });
    }

    pub fn clear_all(&self) {
        self.statuses.send_modify(|map| map.clear());
    }

    /// Mark every known service NOT_SERVING and freeze further updates.
    pub fn shutdown(&self) {
        self.statuses.send_modify(|map| {
            self.shut_down.store(true, Ordering::Release);
            for status in map.values_mut() {
                *status = HealthStatus::NotServing;
            }
        });
    }

    /// Receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<HashMap<String, HealthStatus>> {
        self.statuses.subscribe()
    }
}

impl Default for HealthReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn response(status: HealthStatus) -> HealthCheckResponse {
    HealthCheckResponse {
        status: ServingStatus::from(status) as i32,
    }
}

/// gRPC front end for a [`HealthReporter`].
pub struct HealthService {
    reporter: HealthReporter,
    pool: WorkerPool,
    shutdown: Shutdown,
}

impl HealthService {
    pub fn new(reporter: HealthReporter, pool: WorkerPool, shutdown: Shutdown) -> Self {
        Self {
            reporter,
            pool,
            shutdown,
        }
    }
}

#[tonic::async_trait]
impl Health for HealthService {
    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let _permit = self.pool.acquire().await?;
        let service = request.into_inner().service;

        match self.reporter.check(&service) {
            HealthStatus::ServiceUnknown => {
                debug!(service = %service, "Health check for unknown service");
                Err(Status::not_found("unknown service"))
            }
            status => Ok(Response::new(response(status))),
        }
    }

    type WatchStream = Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send>>;

    async fn watch(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let permit = self.pool.acquire().await?;
        let service = request.into_inner().service;
        let mut updates = self.reporter.subscribe();
        let shutdown = self.shutdown.clone();
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            let _permit = permit;
            let mut last = None;
            loop {
                let current = updates
                    .borrow_and_update()
                    .get(&service)
                    .copied()
                    .unwrap_or(HealthStatus::ServiceUnknown);
                if last != Some(current) {
                    if tx.send(Ok(response(current))).await.is_err() {
                        break;
                    }
                    last = Some(current);
                }

                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                    _ = shutdown.wait() => break,
                }
            }
            debug!(service = %service, "Health watch ended");
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
