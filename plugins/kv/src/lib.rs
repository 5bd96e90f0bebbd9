//! Example key-value plugin.
//!
//! Stores each key in a `kv_<key>` file under the data directory and is
//! served by the plugrt runtime next to its health, stdio and controller
//! services.

pub mod proto {
    #![allow(clippy::derive_partial_eq_without_eq)]

    tonic::include_proto!("proto");
}

pub mod service;

pub use service::KvService;

/// Magic cookie the host sets when it launches this plugin.
pub const MAGIC_COOKIE_KEY: &str = "BASIC_PLUGIN";
pub const MAGIC_COOKIE_VALUE: &str = "hello";
