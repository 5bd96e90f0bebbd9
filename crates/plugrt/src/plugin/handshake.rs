//! The stdout handshake line the host reads to find the plugin.
//!
//! Format: `CORE_VERSION|APP_VERSION|NETWORK|ADDRESS|PROTOCOL`, terminated by
//! a newline and flushed immediately.

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use crate::config::ServeConfig;
use crate::error::{Error, Result};

/// Version of the plugin protocol itself. Bumped only when the handshake
/// or infrastructure services change incompatibly.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Environment variable listing the app versions the host accepts.
pub const PROTOCOL_VERSIONS_ENV: &str = "PLUGIN_PROTOCOL_VERSIONS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Unix => "unix",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "unix" => Ok(Network::Unix),
            other => Err(Error::Handshake(format!("unknown network '{}'", other))),
        }
    }
}

/// Wire protocol label announced to the host. Only gRPC is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Grpc,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Grpc => "grpc",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "grpc" => Ok(Protocol::Grpc),
            other => Err(Error::Handshake(format!("unknown protocol '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub core_version: u32,
    pub app_version: u32,
    pub network: Network,
    pub address: String,
    pub protocol: Protocol,
}

impl Handshake {
    /// Write the line and flush so the host is never left waiting on a buffer.
    pub fn emit<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "{}", self)
            .and_then(|_| out.flush())
            .map_err(|e| Error::Handshake(format!("failed to write handshake: {}", e)))
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.core_version, self.app_version, self.network, self.address, self.protocol
        )
    }
}

impl FromStr for Handshake {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\n', '\r']);
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() != 5 {
            return Err(Error::Handshake(format!(
                "expected 5 fields, got {}: '{}'",
                parts.len(),
                line
            )));
        }

        let version = |s: &str, what: &str| {
            s.parse::<u32>()
                .map_err(|_| Error::Handshake(format!("invalid {} version '{}'", what, s)))
        };
        if parts[3].is_empty() {
            return Err(Error::Handshake("empty address".to_string()));
        }

        Ok(Self {
            core_version: version(parts[0], "core")?,
            app_version: version(parts[1], "app")?,
            network: parts[2].parse()?,
            address: parts[3].to_string(),
            protocol: parts[4].parse()?,
        })
    }
}

/// Pick the app protocol version to announce.
///
/// With a host list, the highest version both sides support wins. Without
/// one, or with no overlap, the lowest supported version is used and the
/// host is left to report the mismatch.
pub fn negotiate_version(supported: &[u32], host_versions: Option<&str>) -> u32 {
    let lowest = supported.iter().copied().min().unwrap_or(1);

    let Some(list) = host_versions else {
        return lowest;
    };

    list.split(',')
        .filter_map(|v| v.trim().parse::<u32>().ok())
        .filter(|v| supported.contains(v))
        .max()
        .unwrap_or(lowest)
}

/// Refuse to run unless the host set the configured magic cookie.
pub fn check_magic_cookie(config: &ServeConfig) -> Result<()> {
    check_magic_cookie_with(config, |key| std::env::var(key).ok())
}

pub(crate) fn check_magic_cookie_with<F>(config: &ServeConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    match (&config.magic_cookie_key, &config.magic_cookie_value) {
        (Some(key), Some(expected)) => match lookup(key) {
            Some(actual) if &actual == expected => Ok(()),
            _ => Err(Error::NotLaunchedByHost),
        },
        _ => Ok(()),
    }
}

/// Human-readable explanation printed when the cookie check fails.
pub const NOT_LAUNCHED_BY_HOST_MESSAGE: &str = "This binary is a plugin. These are not meant to be executed directly.\n\
Please execute the program that consumes these plugins, which will\n\
load any plugins automatically";
