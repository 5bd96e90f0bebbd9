//! Common error types for the plugin runtime.

use thiserror::Error;

/// Errors that stop the plugin from starting or serving.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// gRPC transport error
    #[error("grpc transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Listener could not be bound
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Every port in the configured range was taken
    #[error("couldn't bind plugin TCP listener in port range {min}-{max}")]
    NoPortAvailable { min: u16, max: u16 },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Handshake could not be produced or written
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Magic cookie missing or wrong; the binary was run by hand
    #[error("this binary is a plugin and was not launched by its host")]
    NotLaunchedByHost,
}

/// Result type alias using the runtime Error.
pub type Result<T> = std::result::Result<T, Error>;
