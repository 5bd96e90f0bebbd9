//! Logging setup that routes `tracing` events into the log broker.
//!
//! Stdout is reserved for the handshake line, so no formatter ever writes
//! there: events become [`LogRecord`]s, the broker mirrors them to its
//! fallback sink and queues them for the stdio stream.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ::tracing::field::{Field, Visit};
use ::tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::{prelude::*, EnvFilter, Layer};

use crate::error::{Error, Result};
use crate::plugin::{Level, LogBroker, LogRecord};

/// Initialize tracing with the broker as the only output.
///
/// `RUST_LOG` takes precedence over `default_filter`.
pub fn init(broker: Arc<LogBroker>, default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(BrokerLayer::new(broker))
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install tracing subscriber: {}", e)))
}

/// `tracing-subscriber` layer that emits every event into a [`LogBroker`].
pub struct BrokerLayer {
    broker: Arc<LogBroker>,
}

impl BrokerLayer {
    pub fn new(broker: Arc<LogBroker>) -> Self {
        Self { broker }
    }
}

impl<S: Subscriber> Layer<S> for BrokerLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let mut record = LogRecord::new(Level::from(meta.level()), meta.target(), visitor.message);
        record.fields = visitor.fields;
        self.broker.emit(record);
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields
                .insert(field.name().to_string(), format!("{:?}", value));
        }
    }
}

/// Segment prefixes for lifecycle logging.
pub mod prefix {
    /// Graceful startup prefix
    pub const PULSE_OPEN: &str = "✿";
    /// Graceful shutdown prefix
    pub const PULSE_CLOSE: &str = "❀";
}
