//! `plugin.GRPCStdio` service: forwards broker records over a long-lived stream.
//!
//! The response stream pulls from the broker only when tonic polls it, so a
//! record leaves the queue at the moment it is handed to the transport. A
//! host that cancels leaves every unsent record queued for the next stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream;
use tokio::sync::OwnedSemaphorePermit;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use super::broker::LogBroker;
use super::pool::WorkerPool;
use super::proto::grpc_stdio_server::GrpcStdio;
use super::proto::{stdio_data, Empty, StdioData};
use super::shutdown::Shutdown;
use crate::tracing::prefix;

pub struct StdioService {
    broker: Arc<LogBroker>,
    pool: WorkerPool,
    shutdown: Shutdown,
    pacing: Duration,
    attached: Arc<AtomicBool>,
}

impl StdioService {
    pub fn new(broker: Arc<LogBroker>, pool: WorkerPool, shutdown: Shutdown) -> Self {
        Self {
            broker,
            pool,
            shutdown,
            pacing: Duration::ZERO,
            attached: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pause after each forwarded frame.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Whether a stream consumer is currently attached.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }
}

/// Clears the attached flag when the stream goes away, however it goes away.
struct Attachment(Arc<AtomicBool>);

impl Drop for Attachment {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// State of one attached stream. Dropping it detaches the stream and gives
/// the worker back to the pool.
struct Forwarder {
    broker: Arc<LogBroker>,
    shutdown: Shutdown,
    pacing: Duration,
    reported_drops: u64,
    forwarded: u64,
    _attachment: Attachment,
    _permit: OwnedSemaphorePermit,
}

impl Forwarder {
    /// Wait for the next record and wrap it as a frame. `None` ends the stream.
    async fn next_frame(&mut self) -> Option<StdioData> {
        if self.forwarded > 0 && !self.pacing.is_zero() {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => return None,
                _ = tokio::time::sleep(self.pacing) => {}
            }
        }

        self.report_drops();

        let record = tokio::select! {
            biased;
            _ = self.shutdown.wait() => {
                debug!("Log stream closing for shutdown");
                return None;
            }
            record = self.broker.next_for_stream() => record,
        };
        self.forwarded += 1;

        Some(StdioData {
            channel: stdio_data::Channel::from(record.channel) as i32,
            data: record.encode(),
        })
    }

    fn report_drops(&mut self) {
        let dropped = self.broker.stats().dropped;
        if dropped > self.reported_drops {
            warn!(
                dropped = dropped - self.reported_drops,
                "Log broker overflowed, oldest records were dropped"
            );
            // The warning itself may have evicted another record
            self.reported_drops = self.broker.stats().dropped;
        }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        info!(
            "{} Log stream detached after {} records",
            prefix::PULSE_CLOSE,
            self.forwarded
        );
    }
}

#[tonic::async_trait]
impl GrpcStdio for StdioService {
    type StreamStdioStream = Pin<Box<dyn Stream<Item = Result<StdioData, Status>> + Send>>;

    async fn stream_stdio(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::StreamStdioStream>, Status> {
        if self
            .attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Status::failed_precondition(
                "a log stream is already attached",
            ));
        }
        let attachment = Attachment(self.attached.clone());

        let permit = self.pool.acquire().await?;
        let forwarder = Forwarder {
            broker: self.broker.clone(),
            shutdown: self.shutdown.clone(),
            pacing: self.pacing,
            reported_drops: self.broker.stats().dropped,
            forwarded: 0,
            _attachment: attachment,
            _permit: permit,
        };

        info!("{} Log stream attached", prefix::PULSE_OPEN);
        let frames = stream::unfold(forwarder, |mut forwarder| async move {
            let frame = forwarder.next_frame().await?;
            Some((Ok::<_, Status>(frame), forwarder))
        });

        Ok(Response::new(Box::pin(frames)))
    }
}
