//! KV Plugin - Main Entry Point
//!
//! A gRPC key-value plugin launched by its host. Prints the handshake line
//! on stdout once listening, then serves until SIGINT/SIGTERM or a
//! controller shutdown.
//!
//! Usage:
//!     BASIC_PLUGIN=hello kv-plugin
//!     BASIC_PLUGIN=hello kv-plugin --address 127.0.0.1:1234 --data-dir /var/lib/kv

use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use plugrt::plugin::{
    check_magic_cookie, runtime, LogBroker, Network, PluginServer, SinkHandle,
    NOT_LAUNCHED_BY_HOST_MESSAGE,
};
use plugrt::{Error, ServeConfig};
use plugrt_kv::proto::kv_server::KvServer;
use plugrt_kv::{KvService, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kv-plugin")]
#[command(about = "Key-value plugin served over gRPC")]
#[command(version)]
struct Args {
    /// Listener network (tcp or unix)
    #[arg(long, default_value = "tcp")]
    network: Network,

    /// Fixed TCP address (overrides the port range)
    #[arg(short, long, env = "PLUGIN_ADDRESS")]
    address: Option<SocketAddr>,

    /// Lowest loopback port to try
    #[arg(long, env = "PLUGIN_MIN_PORT")]
    min_port: Option<u16>,

    /// Highest loopback port to try
    #[arg(long, env = "PLUGIN_MAX_PORT")]
    max_port: Option<u16>,

    /// Directory for the unix socket
    #[arg(long, env = "PLUGIN_UNIX_SOCKET_DIR")]
    unix_socket_dir: Option<PathBuf>,

    /// Directory holding the kv_<key> files
    #[arg(long, env = "KV_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Worker pool size
    #[arg(long, default_value_t = plugrt::config::DEFAULT_WORKERS)]
    workers: usize,

    /// Seconds to wait for in-flight calls on shutdown
    #[arg(long, default_value_t = 5)]
    grace_period_secs: u64,

    /// Pause in milliseconds after each forwarded log frame
    #[arg(long, default_value_t = 0)]
    stream_pacing_ms: u64,

    /// Log records kept for the host before the oldest are dropped
    #[arg(long, default_value_t = plugrt::config::DEFAULT_BROKER_CAPACITY)]
    broker_capacity: usize,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write local diagnostics here instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    fn serve_config(&self) -> ServeConfig {
        ServeConfig {
            network: self.network,
            address: self.address,
            port_range: port_range(self.min_port, self.max_port),
            unix_socket_dir: self.unix_socket_dir.clone(),
            workers: self.workers,
            grace_period: Duration::from_secs(self.grace_period_secs),
            stream_pacing: Duration::from_millis(self.stream_pacing_ms),
            broker_capacity: self.broker_capacity,
            ..ServeConfig::new("kv-plugin", env!("CARGO_PKG_VERSION"))
        }
        .magic_cookie(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
    }
}

/// An unset bound counts as 0, so a lone minimum is an inverted range and a
/// lone maximum scans up from the bottom.
fn port_range(min: Option<u16>, max: Option<u16>) -> Option<(u16, u16)> {
    match (min, max) {
        (None, None) => None,
        (min, max) => Some((min.unwrap_or(0), max.unwrap_or(0))),
    }
}

fn start_sink(broker: &Arc<LogBroker>, log_file: Option<&PathBuf>) -> std::io::Result<SinkHandle> {
    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            broker.start_sink(file)
        }
        None => broker.start_sink(std::io::stderr()),
    }
}

fn main() -> ExitCode {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("PANIC: Plugin panicked");
        eprintln!(
            "  Location: {}",
            panic_info
                .location()
                .map(|l| l.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );
        eprintln!(
            "  Message: {}",
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .unwrap_or(&"<no message>")
        );
    }));

    let args = Args::parse();
    let config = args.serve_config();

    if let Err(e) = config.validate() {
        eprintln!("ERROR: {}", e);
        return ExitCode::FAILURE;
    }
    if check_magic_cookie(&config).is_err() {
        eprintln!("{}", NOT_LAUNCHED_BY_HOST_MESSAGE);
        return ExitCode::FAILURE;
    }

    let rt = match runtime(config.workers) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("ERROR: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let broker = Arc::new(LogBroker::new(config.broker_capacity));
    let sink = match start_sink(&broker, args.log_file.as_ref()) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("ERROR: failed to open log sink: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = plugrt::tracing::init(broker.clone(), &args.log_level) {
        eprintln!("WARN: {}", e);
    }

    info!("Initializing KV Plugin");
    info!("  Version: {}", env!("CARGO_PKG_VERSION"));
    info!("  Data dir: {}", args.data_dir.display());

    let result = rt.block_on(async {
        let server = PluginServer::new(config, broker.clone());
        let service = KvService::new(args.data_dir.clone(), server.pool().clone());
        server.add_service(KvServer::new(service)).serve().await
    });
    rt.shutdown_timeout(Duration::from_secs(1));

    let code = match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::NotLaunchedByHost) => {
            eprintln!("{}", NOT_LAUNCHED_BY_HOST_MESSAGE);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            ExitCode::FAILURE
        }
    };

    sink.stop();
    code
}
