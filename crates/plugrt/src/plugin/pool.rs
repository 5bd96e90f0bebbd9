//! Fixed-size worker pool shared by every service.
//!
//! Each call holds one permit while it runs. Streaming calls hand their
//! permit to the task that feeds the stream, so an attached log stream
//! keeps one worker busy for as long as it stays open.

use std::io;
use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tonic::Status;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers not currently running a call.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free worker. Fails once the pool is closed.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, Status> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Status::unavailable("plugin is shutting down"))
    }

    /// Refuse all further calls. Running calls keep their permits.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

/// Build the multi-threaded runtime with one OS thread per pool worker.
pub fn runtime(workers: usize) -> io::Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(workers.max(1))
        .thread_name("plugin-worker")
        .enable_all()
        .build()
}
