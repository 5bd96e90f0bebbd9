//! Listener setup: loopback TCP (fixed, ranged or ephemeral) or a unix socket.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::{debug, warn};

use super::handshake::Network;
use crate::config::ServeConfig;
use crate::error::{Error, Result};

/// A bound listener ready to be handed to the server.
#[derive(Debug)]
pub enum PluginListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, SocketFile),
}

impl PluginListener {
    /// Bind according to the config.
    pub async fn bind(config: &ServeConfig) -> Result<Self> {
        match config.network {
            Network::Tcp => bind_tcp(config).await.map(PluginListener::Tcp),
            #[cfg(unix)]
            Network::Unix => bind_unix(config.unix_socket_dir.as_deref()),
            #[cfg(not(unix))]
            Network::Unix => Err(Error::Config(
                "unix sockets are not supported on this platform".to_string(),
            )),
        }
    }

    pub fn network(&self) -> Network {
        match self {
            PluginListener::Tcp(_) => Network::Tcp,
            #[cfg(unix)]
            PluginListener::Unix(..) => Network::Unix,
        }
    }

    /// Address string as it goes into the handshake.
    pub fn address(&self) -> Result<String> {
        match self {
            PluginListener::Tcp(l) => Ok(l.local_addr()?.to_string()),
            #[cfg(unix)]
            PluginListener::Unix(_, file) => Ok(file.path().display().to_string()),
        }
    }
}

async fn bind_tcp(config: &ServeConfig) -> Result<TcpListener> {
    if let Some(addr) = config.address {
        return TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            address: addr.to_string(),
            source,
        });
    }

    let Some((min, max)) = config.port_range else {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        return TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            address: addr.to_string(),
            source,
        });
    };

    for port in min..=max {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!("Port {} unavailable: {}", port, e),
        }
    }
    Err(Error::NoPortAvailable { min, max })
}

#[cfg(unix)]
fn bind_unix(dir: Option<&Path>) -> Result<PluginListener> {
    let dir = dir
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    let path = dir.join(format!("plugin{}-{}", std::process::id(), nanos));

    let listener = UnixListener::bind(&path).map_err(|source| Error::Bind {
        address: path.display().to_string(),
        source,
    })?;
    Ok(PluginListener::Unix(listener, SocketFile(path)))
}

/// Removes the socket file once serving is done.
#[derive(Debug)]
pub struct SocketFile(PathBuf);

impl SocketFile {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove socket {}: {}", self.0.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ephemeral_loopback() {
        let listener = PluginListener::bind(&ServeConfig::default()).await.unwrap();
        assert_eq!(listener.network(), Network::Tcp);

        let addr: SocketAddr = listener.address().unwrap().parse().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_fixed_address_in_use_fails() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ServeConfig {
            address: Some(taken.local_addr().unwrap()),
            ..Default::default()
        };

        let err = PluginListener::bind(&config).await.unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
    }

    #[tokio::test]
    async fn test_port_range_skips_taken_port() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let Some(max) = port.checked_add(20) else {
            return;
        };
        let config = ServeConfig {
            port_range: Some((port, max)),
            ..Default::default()
        };

        let listener = PluginListener::bind(&config).await.unwrap();
        let addr: SocketAddr = listener.address().unwrap().parse().unwrap();
        assert!(addr.port() > port && addr.port() <= max);
    }

    #[tokio::test]
    async fn test_exhausted_port_range() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let config = ServeConfig {
            port_range: Some((port, port)),
            ..Default::default()
        };

        let err = PluginListener::bind(&config).await.unwrap_err();
        assert!(matches!(err, Error::NoPortAvailable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServeConfig {
            network: Network::Unix,
            unix_socket_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };

        let listener = PluginListener::bind(&config).await.unwrap();
        assert_eq!(listener.network(), Network::Unix);
        let path = PathBuf::from(listener.address().unwrap());
        assert!(path.starts_with(dir.path()));
        assert!(path.exists());

        drop(listener);
        assert!(!path.exists());
    }
}
