//! Log records and their wire encoding.
//!
//! Records on the stderr channel are encoded as one JSON object per line
//! using the `@timestamp`/`@level`/`@module`/`@message` keys the host's log
//! parser understands. Records on the stdout channel carry raw text.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::proto::stdio_data;

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

impl From<&tracing::Level> for Level {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Level::Trace,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warn,
            tracing::Level::ERROR => Level::Error,
        }
    }
}

/// Which stdio stream a record is mirrored onto.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    #[default]
    Stderr,
}

impl From<Channel> for stdio_data::Channel {
    fn from(channel: Channel) -> Self {
        match channel {
            Channel::Stdout => stdio_data::Channel::Stdout,
            Channel::Stderr => stdio_data::Channel::Stderr,
        }
    }
}

/// A single log record produced anywhere in the plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(rename = "@timestamp", with = "micros")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "@level")]
    pub level: Level,
    #[serde(rename = "@module")]
    pub source: String,
    #[serde(rename = "@message")]
    pub message: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, String>,
    #[serde(skip)]
    pub channel: Channel,
}

impl LogRecord {
    /// Create a stderr record stamped with the current time.
    pub fn new(level: Level, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source: source.into(),
            message: message.into(),
            fields: BTreeMap::new(),
            channel: Channel::Stderr,
        }
    }

    /// Create a raw stdout line.
    pub fn stdout(source: impl Into<String>, line: impl Into<String>) -> Self {
        Self {
            channel: Channel::Stdout,
            ..Self::new(Level::Info, source, line)
        }
    }

    /// Attach a key/value field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Encode the record as the bytes of one stdio frame, newline included.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = match self.channel {
            Channel::Stdout => self.message.as_bytes().to_vec(),
            Channel::Stderr => serde_json::to_vec(self)
                .unwrap_or_else(|_| self.message.as_bytes().to_vec()),
        };
        data.push(b'\n');
        data
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:>5} {}: {}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.level.as_str().to_uppercase(),
            self.source,
            self.message
        )?;
        for (key, value) in &self.fields {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

/// RFC 3339 timestamps with exactly six fractional digits.
mod micros {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
