//! Plugin server: bind, announce, serve.

use std::future::Future;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::wrappers::TcpListenerStream;
#[cfg(unix)]
use tokio_stream::wrappers::UnixListenerStream;
use tonic::service::RoutesBuilder;
use tonic::transport::Server;
use tracing::{debug, info, warn};

use super::broker::LogBroker;
use super::controller::ControllerService;
use super::handshake::{
    check_magic_cookie, negotiate_version, Handshake, Protocol, CORE_PROTOCOL_VERSION,
    PROTOCOL_VERSIONS_ENV,
};
use super::health::{HealthReporter, HealthService, HealthStatus, PLUGIN_SERVICE_NAME};
use super::listener::PluginListener;
use super::pool::WorkerPool;
use super::proto::grpc_controller_server::GrpcControllerServer;
use super::proto::grpc_stdio_server::GrpcStdioServer;
use super::proto::health_server::HealthServer;
use super::shutdown::{shutdown_signal, Shutdown};
use super::stdio::StdioService;
use crate::config::ServeConfig;
use crate::error::{Error, Result};
use crate::tracing::prefix;

type ServeFuture = Pin<Box<dyn Future<Output = std::result::Result<(), tonic::transport::Error>> + Send>>;

/// Builder for a plugin server hosting application services next to the
/// health, stdio and controller services.
pub struct PluginServer {
    config: ServeConfig,
    broker: Arc<LogBroker>,
    health: HealthReporter,
    pool: WorkerPool,
    shutdown: Shutdown,
    routes: RoutesBuilder,
}

impl PluginServer {
    /// Create a new plugin server builder.
    pub fn new(config: ServeConfig, broker: Arc<LogBroker>) -> Self {
        let pool = WorkerPool::new(config.workers);
        Self {
            config,
            broker,
            health: HealthReporter::new(),
            pool,
            shutdown: Shutdown::new(),
            routes: RoutesBuilder::default(),
        }
    }

    /// Register an application service.
    pub fn add_service<S>(mut self, service: S) -> Self
    where
        S: tonic::codegen::Service<
                http::Request<tonic::body::BoxBody>,
                Response = http::Response<tonic::body::BoxBody>,
                Error = std::convert::Infallible,
            > + tonic::server::NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        self.routes.add_service(service);
        self
    }

    pub fn health(&self) -> &HealthReporter {
        &self.health
    }

    /// Pool application handlers should draw their permits from.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Validate, check the magic cookie and bind the listener.
    ///
    /// Nothing is written to stdout here; a failure leaves no handshake behind.
    pub async fn bind(self) -> Result<BoundServer> {
        self.config.validate()?;
        check_magic_cookie(&self.config)?;

        let host_versions = std::env::var(PROTOCOL_VERSIONS_ENV).ok();
        let app_version = negotiate_version(&self.config.app_versions, host_versions.as_deref());

        let listener = PluginListener::bind(&self.config).await?;
        let handshake = Handshake {
            core_version: CORE_PROTOCOL_VERSION,
            app_version,
            network: listener.network(),
            address: listener.address()?,
            protocol: Protocol::Grpc,
        };
        debug!(
            network = %handshake.network,
            address = %handshake.address,
            "Plugin address"
        );

        self.health.set_status(PLUGIN_SERVICE_NAME, HealthStatus::Serving);

        Ok(BoundServer {
            server: self,
            listener,
            handshake,
            announced: false,
        })
    }

    /// Bind, print the handshake on stdout, and serve until SIGINT/SIGTERM
    /// or a controller shutdown.
    pub async fn serve(self) -> Result<()> {
        let mut bound = self.bind().await?;

        // Handlers go in before the host learns our address and can signal us
        let signal = shutdown_signal();
        let shutdown = bound.shutdown_handle();
        tokio::spawn(async move {
            signal.await;
            shutdown.trigger();
        });

        {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            bound.announce(&mut out)?;
        }

        bound.run().await
    }
}

/// A server whose listener is bound and whose address is known.
pub struct BoundServer {
    server: PluginServer,
    listener: PluginListener,
    handshake: Handshake,
    announced: bool,
}

impl BoundServer {
    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn health(&self) -> &HealthReporter {
        &self.server.health
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.server.shutdown.clone()
    }

    /// Write the handshake line to `out`. Only the first call succeeds.
    pub fn announce<W: Write>(&mut self, out: &mut W) -> Result<()> {
        if self.announced {
            return Err(Error::Handshake("handshake already announced".to_string()));
        }
        self.handshake.emit(out)?;
        self.announced = true;
        Ok(())
    }

    /// Serve until shutdown is triggered and in-flight calls finish, or the
    /// grace period runs out.
    pub async fn run(self) -> Result<()> {
        let BoundServer {
            server,
            listener,
            handshake,
            ..
        } = self;
        let PluginServer {
            config,
            broker,
            health,
            pool,
            shutdown,
            mut routes,
        } = server;

        info!(
            "{} Starting {} v{}",
            prefix::PULSE_OPEN,
            config.name,
            config.version
        );
        info!("  Address: {} ({})", handshake.address, handshake.network);
        info!("  Workers: {}", pool.size());

        let stdio = StdioService::new(broker, pool.clone(), shutdown.clone())
            .with_pacing(config.effective_pacing());
        routes
            .add_service(HealthServer::new(HealthService::new(
                health.clone(),
                pool.clone(),
                shutdown.clone(),
            )))
            .add_service(GrpcStdioServer::new(stdio))
            .add_service(GrpcControllerServer::new(ControllerService::new(
                shutdown.clone(),
            )));

        let mut builder = Server::builder().concurrency_limit_per_connection(config.workers);
        let router = builder.add_routes(routes.routes());

        let stopping = {
            let shutdown = shutdown.clone();
            async move {
                shutdown.wait().await;
                health.shutdown();
                pool.close();
            }
        };

        let serving: ServeFuture = match listener {
            PluginListener::Tcp(l) => Box::pin(
                router.serve_with_incoming_shutdown(TcpListenerStream::new(l), stopping),
            ),
            #[cfg(unix)]
            PluginListener::Unix(l, socket_file) => Box::pin(async move {
                let _socket_file = socket_file;
                router
                    .serve_with_incoming_shutdown(UnixListenerStream::new(l), stopping)
                    .await
            }),
        };

        let grace = config.grace_period;
        let deadline = async {
            shutdown.wait().await;
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            result = serving => result?,
            _ = deadline => {
                warn!(
                    "{} Calls still in flight after {:?}, stopping anyway",
                    prefix::PULSE_CLOSE,
                    grace
                );
            }
        }

        info!("{} {} shutdown complete", prefix::PULSE_CLOSE, config.name);
        Ok(())
    }
}
