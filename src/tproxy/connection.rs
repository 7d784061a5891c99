//! TPROXY connection representation

use std::net::SocketAddr;
use std::time::Instant;

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::TproxyError;

/// A TPROXY-redirected TCP connection
///
/// The roles are inverted compared to a normal accept: the stream's local
/// address is where the client wanted to go, its peer is the client.
#[derive(Debug)]
pub struct TproxyConnection {
    stream: TcpStream,
    client_addr: SocketAddr,
    original_dst: SocketAddr,
    accepted_at: Instant,
}

impl TproxyConnection {
    /// Wrap an accepted stream, recovering its original destination.
    ///
    /// # Errors
    ///
    /// Returns `TproxyError::OriginalDstError` if the local address of the
    /// stream cannot be read.
    pub fn new(stream: TcpStream, client_addr: SocketAddr) -> Result<Self, TproxyError> {
        let original_dst = stream
            .local_addr()
            .map_err(|e| TproxyError::OriginalDstError(e.to_string()))?;

        debug!(
            "TPROXY connection: {} -> {} (original)",
            client_addr, original_dst
        );

        Ok(Self {
            stream,
            client_addr,
            original_dst,
            accepted_at: Instant::now(),
        })
    }

    /// Consume the connection and return the underlying stream
    #[must_use]
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }

    #[must_use]
    pub const fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    #[must_use]
    pub const fn original_dst(&self) -> SocketAddr {
        self.original_dst
    }

    /// Get the connection age
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.accepted_at.elapsed()
    }
}
