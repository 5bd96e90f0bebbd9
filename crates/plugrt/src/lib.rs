//! # plugrt
//!
//! Plugin-side runtime for host-launched gRPC plugins:
//! - **plugin**: handshake, listener, worker pool, server, health, stdio
//!   streaming and controller services
//! - **config**: serve configuration with defaults and validation
//! - **error**: common error type
//! - **tracing**: `tracing` integration that feeds the log broker
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use plugrt::plugin::{LogBroker, PluginServer};
//! use plugrt::ServeConfig;
//!
//! let broker = Arc::new(LogBroker::new(10_000));
//! plugrt::tracing::init(broker.clone(), "info")?;
//!
//! PluginServer::new(ServeConfig::default(), broker)
//!     .add_service(my_service)
//!     .serve()
//!     .await?;
//! ```

pub mod config;
pub mod error;
pub mod plugin;
pub mod tracing;

pub use config::ServeConfig;
pub use error::{Error, Result};
