//! Serve configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::plugin::Network;

/// Default number of pool workers.
pub const DEFAULT_WORKERS: usize = 10;

/// Default log broker capacity before the oldest records are dropped.
pub const DEFAULT_BROKER_CAPACITY: usize = 10_000;

/// Upper bound for the pause between forwarded log frames.
pub const MAX_STREAM_PACING: Duration = Duration::from_millis(500);

/// Everything the server needs to bind, announce and serve.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// Plugin name used in lifecycle logs
    pub name: String,
    /// Plugin build version used in lifecycle logs
    pub version: String,
    /// Application protocol versions this plugin speaks
    pub app_versions: Vec<u32>,
    /// Environment variable the host sets to prove it launched us
    pub magic_cookie_key: Option<String>,
    /// Expected value of the magic cookie variable
    pub magic_cookie_value: Option<String>,
    /// Listener network family
    pub network: Network,
    /// Fixed TCP address (overrides the port range)
    pub address: Option<SocketAddr>,
    /// Inclusive loopback port range to scan for a free TCP port
    pub port_range: Option<(u16, u16)>,
    /// Directory for the unix socket (system temp dir if unset)
    pub unix_socket_dir: Option<PathBuf>,
    /// Worker pool size shared by every service
    pub workers: usize,
    /// How long shutdown waits for in-flight calls
    pub grace_period: Duration,
    /// Pause after each forwarded log frame
    pub stream_pacing: Duration,
    /// Log records queued for the host before the oldest are dropped
    pub broker_capacity: usize,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            name: "plugin".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            app_versions: vec![1],
            magic_cookie_key: None,
            magic_cookie_value: None,
            network: Network::Tcp,
            address: None,
            port_range: None,
            unix_socket_dir: None,
            workers: DEFAULT_WORKERS,
            grace_period: Duration::from_secs(5),
            stream_pacing: Duration::ZERO,
            broker_capacity: DEFAULT_BROKER_CAPACITY,
        }
    }
}

impl ServeConfig {
    /// Create a config with the given plugin name and version.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    /// Require `key=value` in the environment before starting.
    pub fn magic_cookie(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.magic_cookie_key = Some(key.into());
        self.magic_cookie_value = Some(value.into());
        self
    }

    /// Pause after each forwarded log frame, clamped to [`MAX_STREAM_PACING`].
    pub fn effective_pacing(&self) -> Duration {
        self.stream_pacing.min(MAX_STREAM_PACING)
    }

    /// Check the config for values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.app_versions.is_empty() {
            return Err(Error::Config(
                "at least one app protocol version is required".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.broker_capacity == 0 {
            return Err(Error::Config(
                "broker capacity must be at least 1".to_string(),
            ));
        }
        if let Some((min, max)) = self.port_range {
            if min > max {
                return Err(Error::Config(format!(
                    "PLUGIN_MIN_PORT value of {} is greater than PLUGIN_MAX_PORT value of {}",
                    min, max
                )));
            }
        }
        match (&self.magic_cookie_key, &self.magic_cookie_value) {
            (Some(key), Some(value)) if key.is_empty() || value.is_empty() => Err(Error::Config(
                "magic cookie key and value must not be empty".to_string(),
            )),
            (Some(_), None) | (None, Some(_)) => Err(Error::Config(
                "magic cookie needs both a key and a value".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ServeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.network, Network::Tcp);
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let config = ServeConfig {
            port_range: Some((9010, 9000)),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("PLUGIN_MIN_PORT"));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let config = ServeConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServeConfig {
            broker_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_half_cookie_rejected() {
        let config = ServeConfig {
            magic_cookie_key: Some("KV_PLUGIN".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServeConfig::default().magic_cookie("KV_PLUGIN", "");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pacing_is_clamped() {
        let config = ServeConfig {
            stream_pacing: Duration::from_secs(3),
            ..Default::default()
        };
        assert_eq!(config.effective_pacing(), MAX_STREAM_PACING);
    }
}
