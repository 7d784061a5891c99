//! SOCKS5 negotiation (RFC 1928, RFC 1929)
//!
//! Shared by the TCP CONNECT and UDP ASSOCIATE handlers: greeting, optional
//! username/password sub-negotiation, then one request and its reply.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

use super::address::TargetAddr;
use super::common::{
    reply_message, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, AUTH_METHOD_NONE,
    AUTH_METHOD_NO_ACCEPTABLE, AUTH_METHOD_PASSWORD, AUTH_PASSWORD_VERSION, CMD_CONNECT,
    REPLY_SUCCEEDED, SOCKS5_VERSION,
};
use crate::error::TunnelError;

/// Greeting: password auth is offered only when credentials are set
#[must_use]
pub fn greeting(with_password: bool) -> Vec<u8> {
    if with_password {
        vec![SOCKS5_VERSION, 2, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD]
    } else {
        vec![SOCKS5_VERSION, 1, AUTH_METHOD_NONE]
    }
}

/// Method selection plus optional RFC 1929 authentication
///
/// # Errors
/// `TunnelError::Protocol` for a bad version or unusable method,
/// `TunnelError::AuthRejected` if the credentials are refused.
pub async fn negotiate<S>(
    stream: &mut S,
    credentials: Option<(&str, &str)>,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let methods = greeting(credentials.is_some());
    trace!("Sending SOCKS5 method selection: {:?}", methods);
    stream.write_all(&methods).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    trace!("SOCKS5 method response: {:?}", response);

    if response[0] != SOCKS5_VERSION {
        return Err(TunnelError::protocol(
            "SOCKS5",
            format!("invalid version in method reply: {:02x?}", response),
        ));
    }

    match (response[1], credentials) {
        (AUTH_METHOD_NONE, _) => Ok(()),
        (AUTH_METHOD_PASSWORD, Some((user, password))) => {
            authenticate(stream, user, password).await
        }
        (AUTH_METHOD_NO_ACCEPTABLE, _) => Err(TunnelError::protocol(
            "SOCKS5",
            "no acceptable authentication method",
        )),
        (other, _) => Err(TunnelError::protocol(
            "SOCKS5",
            format!("server selected unoffered method {other:#04x}"),
        )),
    }
}

/// RFC 1929 sub-negotiation.
///
/// Servers disagree on the reply's version byte (0x01 per RFC 1929, 0x05
/// from some implementations); both are accepted. Status must be 0.
async fn authenticate<S>(stream: &mut S, user: &str, password: &str) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ulen = u8::try_from(user.len())
        .map_err(|_| TunnelError::protocol("SOCKS5", "username too long (max 255)"))?;
    let plen = u8::try_from(password.len())
        .map_err(|_| TunnelError::protocol("SOCKS5", "password too long (max 255)"))?;

    let mut auth_req = Vec::with_capacity(3 + user.len() + password.len());
    auth_req.push(AUTH_PASSWORD_VERSION);
    auth_req.push(ulen);
    auth_req.extend_from_slice(user.as_bytes());
    auth_req.push(plen);
    auth_req.extend_from_slice(password.as_bytes());

    trace!("Sending SOCKS5 auth request");
    stream.write_all(&auth_req).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    trace!("SOCKS5 auth response: {:?}", response);

    let version_ok = response[0] == AUTH_PASSWORD_VERSION || response[0] == SOCKS5_VERSION;
    if !version_ok || response[1] != 0x00 {
        warn!("SOCKS5 authentication rejected: {:02x?}", response);
        return Err(TunnelError::AuthRejected {
            version: response[0],
            status: response[1],
        });
    }
    Ok(())
}

/// Encode a request for `cmd` with `addr`
///
/// # Errors
/// `TunnelError::UnsupportedTarget` if `addr` cannot be encoded.
pub fn request(cmd: u8, addr: &TargetAddr) -> Result<BytesMut, TunnelError> {
    let mut buf = BytesMut::with_capacity(22);
    buf.put_u8(SOCKS5_VERSION);
    buf.put_u8(cmd);
    buf.put_u8(0x00);
    addr.write_socks5(&mut buf)?;
    Ok(buf)
}

/// Read a request reply; returns the bound address it carries
///
/// # Errors
/// `TunnelError::Protocol` for a bad version or address,
/// `TunnelError::Socks5Reply` for a non-zero reply code.
pub async fn read_reply<S>(stream: &mut S) -> Result<TargetAddr, TunnelError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    trace!("SOCKS5 reply header: {:?}", header);

    if header[0] != SOCKS5_VERSION {
        return Err(TunnelError::protocol(
            "SOCKS5",
            format!("invalid version in reply: {:02x?}", header),
        ));
    }
    if header[1] != REPLY_SUCCEEDED {
        warn!(
            "SOCKS5 request failed: {} ({:#04x})",
            reply_message(header[1]),
            header[1]
        );
        return Err(TunnelError::Socks5Reply {
            code: header[1],
            message: reply_message(header[1]),
        });
    }

    // rebuild ATYP ADDR PORT and reuse the address parser
    let mut raw = vec![header[3]];
    let rest = match header[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            raw.push(len);
            usize::from(len) + 2
        }
        other => {
            return Err(TunnelError::protocol(
                "SOCKS5",
                format!("unknown address type in reply: {other:#04x}"),
            ))
        }
    };
    let start = raw.len();
    raw.resize(start + rest, 0);
    stream.read_exact(&mut raw[start..]).await?;

    let (bound, _) = TargetAddr::read_socks5(&raw)?;
    Ok(bound)
}

/// Full CONNECT negotiation for `target`
///
/// # Errors
/// Any negotiation failure; see [`negotiate`] and [`read_reply`].
pub async fn socks5_connect<S>(
    stream: &mut S,
    target: &TargetAddr,
    credentials: Option<(&str, &str)>,
) -> Result<TargetAddr, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate(stream, credentials).await?;
    trace!("Sending SOCKS5 CONNECT to {}", target);
    stream.write_all(&request(CMD_CONNECT, target)?).await?;
    read_reply(stream).await
}
