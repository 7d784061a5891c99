//! Tunnel targets and connection keys

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use bytes::{BufMut, BytesMut};

use super::common::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use crate::error::TunnelError;
use crate::fakedns::FakeIpResolver;

/// Where the upstream proxy should connect to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    /// Literal address
    Ip(SocketAddr),
    /// Name without trailing dot, plus port
    Domain(String, u16),
}

impl TargetAddr {
    /// Target for an intercepted flow.
    ///
    /// A destination inside the fake-IP block is turned back into the domain
    /// it was handed out for, when that mapping is still live.
    #[must_use]
    pub fn from_original(dst: SocketAddr, resolver: Option<&FakeIpResolver>) -> Self {
        let Some(resolver) = resolver else {
            return Self::Ip(dst);
        };
        match resolver.get_by_ip(dst.ip()) {
            Some(domain) => Self::Domain(domain.trim_end_matches('.').to_string(), dst.port()),
            None => Self::Ip(dst),
        }
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }

    /// `host:port` as used in an HTTP CONNECT request line
    #[must_use]
    pub fn authority(&self) -> String {
        self.to_string()
    }

    /// Append `ATYP ADDR PORT` in SOCKS5 encoding
    ///
    /// # Errors
    /// Returns `TunnelError::UnsupportedTarget` for domains over 255 bytes.
    pub fn write_socks5(&self, buf: &mut BytesMut) -> Result<(), TunnelError> {
        match self {
            Self::Ip(SocketAddr::V4(v4)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&v4.ip().octets());
                buf.put_u16(v4.port());
            }
            Self::Ip(SocketAddr::V6(v6)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&v6.ip().octets());
                buf.put_u16(v6.port());
            }
            Self::Domain(name, port) => {
                let len = u8::try_from(name.len())
                    .map_err(|_| TunnelError::UnsupportedTarget(self.to_string()))?;
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(len);
                buf.put_slice(name.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(())
    }

    /// Parse `ATYP ADDR PORT` from the front of `data`.
    ///
    /// Returns the address and the number of bytes consumed.
    ///
    /// # Errors
    /// Returns `TunnelError::Protocol` for short input or an unknown type.
    pub fn read_socks5(data: &[u8]) -> Result<(Self, usize), TunnelError> {
        let short = || TunnelError::protocol("SOCKS5", format!("truncated address: {data:02x?}"));
        let atyp = *data.first().ok_or_else(short)?;
        match atyp {
            ATYP_IPV4 => {
                let raw: [u8; 4] = data.get(1..5).ok_or_else(short)?.try_into().map_err(|_| short())?;
                let port = read_port(data, 5).ok_or_else(short)?;
                Ok((Self::Ip(SocketAddr::new(IpAddr::from(raw), port)), 7))
            }
            ATYP_IPV6 => {
                let raw: [u8; 16] =
                    data.get(1..17).ok_or_else(short)?.try_into().map_err(|_| short())?;
                let port = read_port(data, 17).ok_or_else(short)?;
                Ok((Self::Ip(SocketAddr::new(IpAddr::from(raw), port)), 19))
            }
            ATYP_DOMAIN => {
                let len = usize::from(*data.get(1).ok_or_else(short)?);
                let name = data.get(2..2 + len).ok_or_else(short)?;
                let name = String::from_utf8(name.to_vec())
                    .map_err(|_| TunnelError::protocol("SOCKS5", "domain is not UTF-8"))?;
                let port = read_port(data, 2 + len).ok_or_else(short)?;
                Ok((Self::Domain(name, port), 4 + len))
            }
            other => Err(TunnelError::protocol(
                "SOCKS5",
                format!("unknown address type {other:#04x}"),
            )),
        }
    }
}

fn read_port(data: &[u8], at: usize) -> Option<u16> {
    let raw = data.get(at..at + 2)?;
    Some(u16::from_be_bytes([raw[0], raw[1]]))
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
            Self::Domain(name, port) => write!(f, "{name}:{port}"),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::Ip(addr)
    }
}

/// One intercepted flow: real client and original destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl HandlerKey {
    #[must_use]
    pub const fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self { src, dst }
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}
