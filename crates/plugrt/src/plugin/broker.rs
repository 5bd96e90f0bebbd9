//! In-process log broker.
//!
//! Any code path may [`emit`](LogBroker::emit) records; a single stream
//! consumer pulls them back out in production order with
//! [`next_for_stream`](LogBroker::next_for_stream). Emitting never blocks:
//! the queue is bounded and drops its oldest record when full, counting
//! every drop in [`BrokerStats`].
//!
//! A local fallback sink can be attached with
//! [`start_sink`](LogBroker::start_sink). It runs on its own thread, fed by
//! a bounded channel, and is stopped explicitly through [`SinkHandle`].

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::record::{Channel, LogRecord};

/// Counters describing broker throughput and loss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Records accepted by `emit`
    pub emitted: u64,
    /// Records evicted from the stream queue by drop-oldest
    pub dropped: u64,
    /// Records the fallback sink could not keep up with
    pub sink_dropped: u64,
    /// Records currently waiting for a stream consumer
    pub queued: usize,
}

pub struct LogBroker {
    queue: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
    available: Notify,
    sink: Mutex<Option<mpsc::Sender<LogRecord>>>,
    emitted: AtomicU64,
    dropped: AtomicU64,
    sink_dropped: AtomicU64,
}

impl LogBroker {
    /// Create a broker holding at most `capacity` undelivered records.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            available: Notify::new(),
            sink: Mutex::new(None),
            emitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            sink_dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue a record for the stream and mirror it to the fallback sink.
    pub fn emit(&self, record: LogRecord) {
        if let Some(sink) = self.sink.lock().as_ref() {
            if sink.try_send(record.clone()).is_err() {
                self.sink_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(record);
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);
        self.available.notify_one();
    }

    /// Wait until a record is available and take the oldest one.
    ///
    /// Cancel-safe: a record is only removed from the queue in the same
    /// poll that returns it.
    pub async fn next_for_stream(&self) -> LogRecord {
        loop {
            if let Some(record) = self.try_next() {
                return record;
            }
            self.available.notified().await;
        }
    }

    /// Take the oldest record without waiting.
    pub fn try_next(&self) -> Option<LogRecord> {
        self.queue.lock().pop_front()
    }

    /// Put a record that could not be delivered back at the head of the queue.
    pub fn unread(&self, record: LogRecord) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                // The record being returned is older than anything queued
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            queue.push_front(record);
        }
        self.available.notify_one();
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            sink_dropped: self.sink_dropped.load(Ordering::Relaxed),
            queued: self.queue.lock().len(),
        }
    }

    /// Start the fallback sink thread writing human-readable lines to `out`.
    ///
    /// Replaces any previously attached sink; the old sink thread drains and
    /// exits once its channel closes.
    pub fn start_sink<W>(self: &Arc<Self>, out: W) -> io::Result<SinkHandle>
    where
        W: Write + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<LogRecord>(self.capacity);
        let thread = std::thread::Builder::new()
            .name("log-sink".to_string())
            .spawn(move || {
                let mut out = out;
                while let Some(record) = rx.blocking_recv() {
                    // A broken sink must not take the plugin down
                    let _ = writeln!(out, "{}", record);
                    let _ = out.flush();
                }
            })?;

        *self.sink.lock() = Some(tx);

        Ok(SinkHandle {
            broker: Arc::clone(self),
            thread: Some(thread),
        })
    }

    /// An `io::Write` adapter emitting one record per written line.
    pub fn writer(self: &Arc<Self>, channel: Channel, source: impl Into<String>) -> BrokerWriter {
        BrokerWriter {
            broker: Arc::clone(self),
            channel,
            source: source.into(),
            pending: Vec::new(),
        }
    }
}

impl Default for LogBroker {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_BROKER_CAPACITY)
    }
}

/// Handle to the running fallback sink thread.
pub struct SinkHandle {
    broker: Arc<LogBroker>,
    thread: Option<JoinHandle<()>>,
}

impl SinkHandle {
    /// Detach the sink, let it write what it already received, and join it.
    pub fn stop(mut self) {
        self.broker.sink.lock().take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Line-buffering writer that turns output into broker records.
pub struct BrokerWriter {
    broker: Arc<LogBroker>,
    channel: Channel,
    source: String,
    pending: Vec<u8>,
}

impl BrokerWriter {
    fn emit_line(&self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches(['\n', '\r']);
        let record = match self.channel {
            Channel::Stdout => LogRecord::stdout(self.source.as_str(), text),
            Channel::Stderr => {
                LogRecord::new(super::record::Level::Info, self.source.as_str(), text)
            }
        };
        self.broker.emit(record);
    }
}

impl Write for BrokerWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit_line(&line);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit_line(&line);
        }
        Ok(())
    }
}

impl Drop for BrokerWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::record::Level;
    use std::time::{Duration, Instant};

    fn record(message: &str) -> LogRecord {
        LogRecord::new(Level::Info, "test", message)
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_records_buffered_before_consumer_arrive_in_order() {
        let broker = LogBroker::new(16);
        for msg in ["R1", "R2", "R3"] {
            broker.emit(record(msg));
        }

        assert_eq!(broker.next_for_stream().await.message, "R1");
        assert_eq!(broker.next_for_stream().await.message, "R2");
        assert_eq!(broker.next_for_stream().await.message, "R3");

        broker.emit(record("R4"));
        assert_eq!(broker.next_for_stream().await.message, "R4");
        assert!(broker.try_next().is_none());
    }

    #[tokio::test]
    async fn test_consumer_wakes_on_emit() {
        let broker = Arc::new(LogBroker::new(16));
        let consumer = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.next_for_stream().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.emit(record("late"));

        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake")
            .unwrap();
        assert_eq!(got.message, "late");
    }

    #[test]
    fn test_emit_never_blocks_when_full() {
        let broker = LogBroker::new(4);
        let start = Instant::now();
        for i in 0..10_000 {
            broker.emit(record(&format!("r{}", i)));
        }
        assert!(start.elapsed() < Duration::from_secs(2));

        let stats = broker.stats();
        assert_eq!(stats.emitted, 10_000);
        assert_eq!(stats.dropped, 9_996);
        assert_eq!(stats.queued, 4);

        // Drop-oldest keeps the newest records
        assert_eq!(broker.try_next().unwrap().message, "r9996");
    }

    #[test]
    fn test_unread_goes_back_to_head() {
        let broker = LogBroker::new(8);
        broker.emit(record("a"));
        broker.emit(record("b"));

        let first = broker.try_next().unwrap();
        broker.unread(first);

        assert_eq!(broker.try_next().unwrap().message, "a");
        assert_eq!(broker.try_next().unwrap().message, "b");
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        let broker = Arc::new(LogBroker::new(100_000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let broker = broker.clone();
                std::thread::spawn(move || {
                    for i in 0..1_000 {
                        broker.emit(record(&format!("{}-{}", t, i)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut last_seen = vec![-1i64; 8];
        let mut count = 0;
        while let Some(rec) = broker.try_next() {
            let (t, i) = rec.message.split_once('-').unwrap();
            let (t, i): (usize, i64) = (t.parse().unwrap(), i.parse().unwrap());
            // Each producer's records stay in its own emission order
            assert!(i > last_seen[t]);
            last_seen[t] = i;
            count += 1;
        }
        assert_eq!(count, 8_000);
        assert_eq!(broker.stats().dropped, 0);
    }

    #[test]
    fn test_sink_receives_every_record() {
        let broker = Arc::new(LogBroker::new(64));
        let buf = SharedBuf::default();
        let sink = broker.start_sink(buf.clone()).unwrap();

        broker.emit(record("one"));
        broker.emit(record("two"));
        sink.stop();

        let text = String::from_utf8(buf.0.lock().clone()).unwrap();
        assert!(text.contains("test: one"));
        assert!(text.contains("test: two"));

        // Records still reach the stream queue
        assert_eq!(broker.stats().queued, 2);
    }

    #[test]
    fn test_writer_splits_lines() {
        let broker = Arc::new(LogBroker::new(16));
        {
            let mut out = broker.writer(Channel::Stdout, "app");
            write!(out, "first\nsec").unwrap();
            write!(out, "ond\ntail").unwrap();
        }

        let lines: Vec<_> = std::iter::from_fn(|| broker.try_next()).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].message, "first");
        assert_eq!(lines[1].message, "second");
        assert_eq!(lines[2].message, "tail");
        assert!(lines.iter().all(|r| r.channel == Channel::Stdout));
    }
}
