//! gRPC plugin infrastructure.
//!
//! Provides everything a plugin process needs besides its own services:
//! - Handshake line on stdout once the listener is bound
//! - Server setup with a shared worker pool and graceful shutdown
//! - Health, stdio log streaming and controller services
//! - The log broker that bridges `tracing` into the stdio stream

mod broker;
mod controller;
mod handshake;
mod health;
mod listener;
mod pool;
mod record;
mod server;
mod shutdown;
mod stdio;

pub mod proto {
    //! Compiled protobuf definitions for the infrastructure services.
    #![allow(clippy::derive_partial_eq_without_eq)]
    #![allow(clippy::enum_variant_names)]

    tonic::include_proto!("plugin");

    pub mod health {
        tonic::include_proto!("grpc.health.v1");
    }

    pub use health::*;
}

pub use broker::{BrokerStats, BrokerWriter, LogBroker, SinkHandle};
pub use controller::ControllerService;
pub use handshake::{
    check_magic_cookie, negotiate_version, Handshake, Network, Protocol, CORE_PROTOCOL_VERSION,
    NOT_LAUNCHED_BY_HOST_MESSAGE, PROTOCOL_VERSIONS_ENV,
};
pub use health::{HealthReporter, HealthService, HealthStatus, PLUGIN_SERVICE_NAME};
pub use listener::{PluginListener, SocketFile};
pub use pool::{runtime, WorkerPool};
pub use record::{Channel, Level, LogRecord};
pub use server::{BoundServer, PluginServer};
pub use shutdown::{shutdown_signal, Shutdown};
pub use stdio::StdioService;
