//! `plugin.GRPCController` service: lets the host ask the plugin to exit.

use tonic::{Request, Response, Status};
use tracing::info;

use super::proto::grpc_controller_server::GrpcController;
use super::proto::Empty;
use super::shutdown::Shutdown;
use crate::tracing::prefix;

pub struct ControllerService {
    shutdown: Shutdown,
}

impl ControllerService {
    pub fn new(shutdown: Shutdown) -> Self {
        Self { shutdown }
    }
}

#[tonic::async_trait]
impl GrpcController for ControllerService {
    async fn shutdown(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        info!("{} Host requested shutdown", prefix::PULSE_CLOSE);
        // Graceful: the reply still goes out before the server stops
        self.shutdown.trigger();
        Ok(Response::new(Empty {}))
    }
}
