//! TPROXY TCP Listener

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{debug, info};

use super::connection::TproxyConnection;
use super::socket::SocketProvider;
use crate::error::TproxyError;

/// Pending connection queue length
const TCP_BACKLOG: i32 = 1024;

/// A TPROXY TCP listener that accepts connections with original destination info
#[derive(Debug)]
pub struct TproxyListener {
    listener: TcpListener,
    listen_addr: SocketAddr,
}

impl TproxyListener {
    /// Create and bind a listener through `provider`.
    ///
    /// # Errors
    ///
    /// Returns `TproxyError` if socket creation, binding or listen fails,
    /// including `PermissionDenied` without `CAP_NET_ADMIN`.
    pub fn bind(addr: SocketAddr, provider: &dyn SocketProvider) -> Result<Self, TproxyError> {
        info!("Creating TPROXY TCP listener on {}", addr);

        let socket = provider.tcp_listener(addr)?;
        socket
            .listen(TCP_BACKLOG)
            .map_err(|e| TproxyError::socket_option("listen", e.to_string()))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| TproxyError::SocketCreation(e.to_string()))?;
        let listen_addr = listener.local_addr()?;

        info!("TPROXY TCP listener ready on {}", listen_addr);
        Ok(Self {
            listener,
            listen_addr,
        })
    }

    /// Accept a new TPROXY connection.
    ///
    /// # Errors
    ///
    /// Returns `TproxyError::AcceptError` if accept fails, or
    /// `TproxyError::OriginalDstError` if the destination is unreadable.
    pub async fn accept(&self) -> Result<TproxyConnection, TproxyError> {
        let (stream, client_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| TproxyError::AcceptError(e.to_string()))?;

        debug!("Accepted connection from {}", client_addr);
        TproxyConnection::new(stream, client_addr)
    }

    /// Get the listen address.
    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }
}
