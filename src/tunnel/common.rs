//! Shared protocol constants and helpers (RFC 1928, RFC 1929, SOCKS4)

use std::future::Future;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::TunnelError;

// ============================================================================
// SOCKS5
// ============================================================================

/// SOCKS5 protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

/// No authentication required
pub const AUTH_METHOD_NONE: u8 = 0x00;

/// Username/password authentication (RFC 1929)
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;

/// Server rejects all offered methods
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Username/password sub-negotiation version (RFC 1929)
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;

/// CONNECT command
pub const CMD_CONNECT: u8 = 0x01;

/// UDP ASSOCIATE command
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_NOT_ALLOWED: u8 = 0x02;
pub const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_TTL_EXPIRED: u8 = 0x06;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// RSV(2) + FRAG(1) + ATYP(1) + IPv4(4) + PORT(2)
pub const UDP_HEADER_MIN_SIZE: usize = 10;

// ============================================================================
// SOCKS4
// ============================================================================

pub const SOCKS4_VERSION: u8 = 0x04;

/// Reply version byte (always zero)
pub const SOCKS4_REPLY_VERSION: u8 = 0x00;

/// Request granted
pub const SOCKS4_GRANTED: u8 = 0x5A;

pub const SOCKS4_REPLY_LEN: usize = 8;

/// Convert a SOCKS5 reply code to a human-readable message
#[must_use]
pub const fn reply_message(code: u8) -> &'static str {
    match code {
        REPLY_SUCCEEDED => "succeeded",
        REPLY_GENERAL_FAILURE => "general SOCKS server failure",
        REPLY_NOT_ALLOWED => "connection not allowed by ruleset",
        REPLY_NETWORK_UNREACHABLE => "network unreachable",
        REPLY_HOST_UNREACHABLE => "host unreachable",
        REPLY_CONNECTION_REFUSED => "connection refused",
        REPLY_TTL_EXPIRED => "TTL expired",
        REPLY_COMMAND_NOT_SUPPORTED => "command not supported",
        REPLY_ADDRESS_TYPE_NOT_SUPPORTED => "address type not supported",
        _ => "unknown error",
    }
}

/// Deadlines applied to each tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelTimeouts {
    /// Upstream TCP connect
    pub dial: Duration,
    /// Whole protocol negotiation after the dial
    pub handshake: Duration,
    /// A UDP association with no traffic in either direction is closed
    pub udp_idle: Duration,
}

impl Default for TunnelTimeouts {
    fn default() -> Self {
        Self {
            dial: Duration::from_secs(3),
            handshake: Duration::from_secs(10),
            udp_idle: Duration::from_secs(60),
        }
    }
}

/// Connect to the upstream proxy at `addr` (`host:port`) within `limit`
///
/// # Errors
/// Returns `TunnelError::Timeout` or `TunnelError::ConnectFailed`.
pub async fn dial(addr: &str, limit: Duration) -> Result<TcpStream, TunnelError> {
    trace!("Dialing proxy {}", addr);
    let stream = match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(TunnelError::connect_failed(addr, e.to_string())),
        Err(_) => {
            return Err(TunnelError::Timeout {
                stage: "Dial",
                addr: addr.to_string(),
                timeout_secs: limit.as_secs(),
            })
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY to {}: {}", addr, e);
    }
    Ok(stream)
}

/// Keep long-lived control connections from silently dying
pub fn enable_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!("Failed to enable keepalive: {}", e);
    }
}

/// Run a handshake future under `limit`
///
/// # Errors
/// Returns `TunnelError::Timeout` if the deadline passes, otherwise the
/// handshake's own result.
pub async fn with_deadline<T, F>(limit: Duration, addr: &str, fut: F) -> Result<T, TunnelError>
where
    F: Future<Output = Result<T, TunnelError>>,
{
    timeout(limit, fut).await.unwrap_or_else(|_| {
        Err(TunnelError::Timeout {
            stage: "Handshake",
            addr: addr.to_string(),
            timeout_secs: limit.as_secs(),
        })
    })
}
