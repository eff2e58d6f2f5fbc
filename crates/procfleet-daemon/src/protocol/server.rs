//! Control-socket accept loop.
//!
//! The server binds a loopback TCP listener (IPv4 or IPv6 per preference,
//! ephemeral port by default) and spawns one session task per accepted
//! connection, bounded by a semaphore so a connect flood cannot exhaust
//! the daemon. The bound address is published so the bootstrap entry point
//! can inject it into the privileged child's command line.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::session;
use crate::supervisor::SupervisorHandle;

const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Which loopback family to bind when no explicit address is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpPreference {
    #[default]
    V4,
    V6,
}

impl IpPreference {
    const fn loopback(self) -> IpAddr {
        match self {
            Self::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Self::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }
}

/// Control server configuration.
#[derive(Debug, Clone)]
pub struct ControlServerConfig {
    /// Explicit bind address; loopback per [`IpPreference`] when unset.
    pub bind_address: Option<IpAddr>,
    /// Port to bind; 0 asks the OS for an ephemeral port.
    pub port: u16,
    pub preference: IpPreference,
    pub max_connections: usize,
}

impl ControlServerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = Some(address);
        self
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub const fn with_preference(mut self, preference: IpPreference) -> Self {
        self.preference = preference;
        self
    }

    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }
}

impl Default for ControlServerConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            port: 0,
            preference: IpPreference::V4,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// The bound control socket and its accept loop.
#[derive(Debug)]
pub struct ControlServer {
    listener: TcpListener,
    limit: Arc<Semaphore>,
}

impl ControlServer {
    /// Bind the control socket.
    ///
    /// # Errors
    ///
    /// Propagates the bind failure.
    pub async fn bind(config: &ControlServerConfig) -> io::Result<Self> {
        let address = config
            .bind_address
            .unwrap_or_else(|| config.preference.loopback());
        let listener = TcpListener::bind((address, config.port)).await?;
        info!(address = %listener.local_addr()?, "control socket bound");
        Ok(Self {
            listener,
            limit: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    /// The address the socket actually bound, ephemeral port resolved.
    ///
    /// # Errors
    ///
    /// Propagates the socket query failure.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns the accept error that ended the loop.
    pub async fn serve(self, supervisor: SupervisorHandle) -> io::Result<()> {
        loop {
            let Ok(permit) = Arc::clone(&self.limit).acquire_owned().await else {
                // The semaphore is never closed while the server lives.
                return Ok(());
            };
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "connection accepted");
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(error) = session::serve_connection(stream, supervisor).await {
                    warn!(%peer, %error, "session terminated");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_ipv4_loopback_on_ephemeral_port() {
        let server = ControlServer::bind(&ControlServerConfig::new())
            .await
            .expect("bind");
        let addr = server.local_addr().expect("local addr");
        assert!(addr.ip().is_loopback());
        assert!(addr.is_ipv4());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn binds_ipv6_loopback_when_preferred() {
        let config = ControlServerConfig::new().with_preference(IpPreference::V6);
        let server = ControlServer::bind(&config).await.expect("bind");
        let addr = server.local_addr().expect("local addr");
        assert!(addr.is_ipv6());
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn explicit_address_wins_over_preference() {
        let config = ControlServerConfig::new()
            .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_preference(IpPreference::V6);
        let server = ControlServer::bind(&config).await.expect("bind");
        assert!(server.local_addr().expect("local addr").is_ipv4());
    }
}
