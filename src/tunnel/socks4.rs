//! SOCKS4 CONNECT negotiation
//!
//! ```text
//! request: VN=4 | CD=1 | DSTPORT(2) | DSTIP(4) | USERID | NUL
//! reply:   VN=0 | CD=0x5A | DSTPORT(2) | DSTIP(4)
//! ```

use std::net::{SocketAddr, SocketAddrV4};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use super::address::TargetAddr;
use super::common::{
    CMD_CONNECT, SOCKS4_GRANTED, SOCKS4_REPLY_LEN, SOCKS4_REPLY_VERSION, SOCKS4_VERSION,
};
use crate::error::TunnelError;

/// IPv4 endpoint for `target`; SOCKS4 cannot carry names or IPv6
///
/// # Errors
/// `TunnelError::UnsupportedTarget` when no IPv4 address is available.
pub async fn resolve_ipv4(target: &TargetAddr) -> Result<SocketAddrV4, TunnelError> {
    match target {
        TargetAddr::Ip(SocketAddr::V4(v4)) => Ok(*v4),
        TargetAddr::Ip(SocketAddr::V6(_)) => Err(TunnelError::UnsupportedTarget(target.to_string())),
        TargetAddr::Domain(name, port) => {
            let found = tokio::net::lookup_host((name.as_str(), *port))
                .await
                .map_err(|e| TunnelError::UnsupportedTarget(format!("{target}: {e}")))?
                .find_map(|addr| match addr {
                    SocketAddr::V4(v4) => Some(v4),
                    SocketAddr::V6(_) => None,
                });
            let v4 = found.ok_or_else(|| {
                TunnelError::UnsupportedTarget(format!("{target}: no IPv4 address"))
            })?;
            debug!("SOCKS4 resolved {} to {}", target, v4);
            Ok(v4)
        }
    }
}

/// Encode a CONNECT request
#[must_use]
pub fn connect_request(dst: SocketAddrV4, user_id: Option<&str>) -> Vec<u8> {
    let user = user_id.unwrap_or_default().as_bytes();
    let mut req = Vec::with_capacity(9 + user.len());
    req.push(SOCKS4_VERSION);
    req.push(CMD_CONNECT);
    req.extend_from_slice(&dst.port().to_be_bytes());
    req.extend_from_slice(&dst.ip().octets());
    req.extend_from_slice(user);
    req.push(0);
    req
}

/// Negotiate a SOCKS4 tunnel to `target` over `stream`
///
/// # Errors
/// `TunnelError::Socks4Rejected` unless the reply starts `{0x00, 0x5A}`.
pub async fn socks4_connect<S>(
    stream: &mut S,
    target: &TargetAddr,
    user_id: Option<&str>,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let dst = resolve_ipv4(target).await?;
    trace!("Sending SOCKS4 CONNECT to {}", dst);
    stream.write_all(&connect_request(dst, user_id)).await?;

    let mut reply = [0u8; SOCKS4_REPLY_LEN];
    stream.read_exact(&mut reply).await?;
    trace!("SOCKS4 reply: {:02x?}", reply);

    if reply[0] != SOCKS4_REPLY_VERSION || reply[1] != SOCKS4_GRANTED {
        warn!("SOCKS4 proxy rejected {}: reply {:02x?}", target, &reply[..2]);
        return Err(TunnelError::Socks4Rejected {
            version: reply[0],
            code: reply[1],
        });
    }
    Ok(())
}
