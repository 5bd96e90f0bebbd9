//! Graceful shutdown utilities.

use std::future::Future;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use crate::tracing::prefix;

/// Cloneable one-way shutdown trigger shared by the server and its services.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Begin shutting down. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once [`trigger`](Self::trigger) has been called.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close under us
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the Ctrl+C and SIGTERM handlers and return a future that
/// resolves when either fires.
///
/// The handlers are in place once this returns, so a signal that arrives
/// before the future is first polled still counts. Must be called inside a
/// tokio runtime. If a handler can't be installed that branch never fires.
#[cfg(unix)]
pub fn shutdown_signal() -> impl Future<Output = ()> + Send + 'static {
    use signal::unix::{signal, SignalKind};

    let interrupt = signal(SignalKind::interrupt())
        .map_err(|e| error!("Failed to install Ctrl+C handler: {}", e))
        .ok();
    let terminate = signal(SignalKind::terminate())
        .map_err(|e| error!("Failed to install signal handler: {}", e))
        .ok();

    async move {
        tokio::select! {
            _ = recv(interrupt) => {
                info!("{} Received Ctrl+C, shutting down", prefix::PULSE_CLOSE);
            }
            _ = recv(terminate) => {
                info!("{} Received terminate signal, shutting down", prefix::PULSE_CLOSE);
            }
        }
    }
}

#[cfg(unix)]
async fn recv(sig: Option<signal::unix::Signal>) {
    match sig {
        Some(mut sig) => {
            sig.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
pub fn shutdown_signal() -> impl Future<Output = ()> + Send + 'static {
    async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("{} Received Ctrl+C, shutting down", prefix::PULSE_CLOSE);
    }
}
