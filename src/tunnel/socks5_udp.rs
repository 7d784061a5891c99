//! SOCKS5 UDP ASSOCIATE (RFC 1928 section 7)
//!
//! ```text
//! +-----+------+------+----------+----------+----------+
//! | RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +-----+------+------+----------+----------+----------+
//! |  2  |  1   |  1   | Variable |    2     | Variable |
//! +-----+------+------+----------+----------+----------+
//! ```
//!
//! The TCP control connection must stay open for the association to live;
//! the relay drops it when the control connection closes.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

use super::address::TargetAddr;
use super::common::{enable_keepalive, CMD_UDP_ASSOCIATE, UDP_HEADER_MIN_SIZE};
use super::socks5::{negotiate, read_reply, request};
use crate::error::TunnelError;

/// Wrap `data` for the relay
///
/// # Errors
/// `TunnelError::UnsupportedTarget` if `target` cannot be encoded.
pub fn encapsulate(target: &TargetAddr, data: &[u8]) -> Result<BytesMut, TunnelError> {
    let mut buf = BytesMut::with_capacity(UDP_HEADER_MIN_SIZE + 12 + data.len());
    buf.put_u16(0);
    buf.put_u8(0);
    target.write_socks5(&mut buf)?;
    buf.put_slice(data);
    Ok(buf)
}

/// Split a relay datagram into its source address and payload.
///
/// # Errors
/// `TunnelError::Protocol` for short packets, a non-zero RSV, or a
/// fragment (FRAG != 0 is never reassembled).
pub fn decapsulate(packet: &[u8]) -> Result<(TargetAddr, &[u8]), TunnelError> {
    if packet.len() < UDP_HEADER_MIN_SIZE {
        return Err(TunnelError::protocol(
            "SOCKS5",
            format!("UDP packet too short: {} bytes", packet.len()),
        ));
    }
    let rsv = u16::from_be_bytes([packet[0], packet[1]]);
    if rsv != 0 {
        return Err(TunnelError::protocol(
            "SOCKS5",
            format!("RSV field must be zero, got {rsv:#06x}"),
        ));
    }
    if packet[2] != 0 {
        return Err(TunnelError::protocol(
            "SOCKS5",
            format!("fragmented UDP packet (frag {})", packet[2]),
        ));
    }
    let (addr, used) = TargetAddr::read_socks5(&packet[3..])?;
    Ok((addr, &packet[3 + used..]))
}

/// Relay side of an association: a UDP socket connected to BND.ADDR
#[derive(Debug)]
pub struct Socks5UdpRelay {
    socket: UdpSocket,
    relay: SocketAddr,
}

impl Socks5UdpRelay {
    /// Send `data` for `target` through the relay
    ///
    /// # Errors
    /// Encoding or socket errors.
    pub async fn send_to(&self, target: &TargetAddr, data: &[u8]) -> Result<usize, TunnelError> {
        let packet = encapsulate(target, data)?;
        self.socket.send(&packet).await?;
        trace!("SOCKS5 UDP: sent {} bytes to {} via {}", data.len(), target, self.relay);
        Ok(data.len())
    }

    /// Receive one raw (still encapsulated) datagram
    ///
    /// # Errors
    /// Socket errors.
    pub async fn recv_raw(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        Ok(self.socket.recv(buf).await?)
    }

    #[must_use]
    pub const fn relay_addr(&self) -> SocketAddr {
        self.relay
    }
}

/// An open UDP ASSOCIATE: control connection plus relay socket
pub struct Socks5UdpAssociation {
    control: TcpStream,
    relay: Socks5UdpRelay,
}

impl fmt::Debug for Socks5UdpAssociation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socks5UdpAssociation")
            .field("proxy", &self.control.peer_addr().ok())
            .field("relay", &self.relay.relay)
            .finish()
    }
}

impl Socks5UdpAssociation {
    /// Negotiate UDP ASSOCIATE on an already dialed control connection.
    ///
    /// The request carries the loopback placeholder `127.0.0.1:0`; the
    /// proxy picks the relay. An unspecified
    /// relay address in the reply means "same host as the proxy".
    ///
    /// # Errors
    /// Negotiation failures, or a relay given as a domain name.
    pub async fn establish(
        mut control: TcpStream,
        credentials: Option<(&str, &str)>,
    ) -> Result<Self, TunnelError> {
        let proxy = control.peer_addr()?;
        debug!("Establishing SOCKS5 UDP ASSOCIATE via {}", proxy);
        enable_keepalive(&control);

        negotiate(&mut control, credentials).await?;
        let placeholder = TargetAddr::Ip(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)));
        control
            .write_all(&request(CMD_UDP_ASSOCIATE, &placeholder)?)
            .await?;

        let relay = match read_reply(&mut control).await? {
            TargetAddr::Ip(addr) if addr.ip().is_unspecified() => {
                SocketAddr::new(proxy.ip(), addr.port())
            }
            TargetAddr::Ip(addr) => addr,
            TargetAddr::Domain(name, port) => {
                return Err(TunnelError::protocol(
                    "SOCKS5",
                    format!("relay address given as domain {name}:{port}"),
                ))
            }
        };

        let bind: SocketAddr = if relay.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(relay).await?;

        debug!("SOCKS5 UDP ASSOCIATE established, relay at {}", relay);
        Ok(Self {
            control,
            relay: Socks5UdpRelay { socket, relay },
        })
    }

    #[must_use]
    pub const fn relay_addr(&self) -> SocketAddr {
        self.relay.relay
    }

    #[must_use]
    pub const fn relay(&self) -> &Socks5UdpRelay {
        &self.relay
    }

    /// Separate the control connection from the relay so both can be
    /// polled at once
    #[must_use]
    pub fn into_parts(self) -> (TcpStream, Socks5UdpRelay) {
        (self.control, self.relay)
    }
}
