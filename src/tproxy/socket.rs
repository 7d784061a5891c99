//! TPROXY socket utilities
//!
//! - `IP_TRANSPARENT`: bind to non-local addresses and receive TPROXY traffic
//! - `IP_RECVORIGDSTADDR`: original destination of each UDP datagram in cmsg
//!
//! With TPROXY the original destination of a TCP connection is simply the
//! accepted socket's local address; no getsockopt is needed.
//!
//! # Socket Provider Trait
//!
//! Socket creation goes through [`SocketProvider`] so listeners and the
//! UDP fake dial can run on plain sockets when `CAP_NET_ADMIN` is not
//! available (tests, local debugging).

use std::fmt;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::error::{TproxyError, UdpError};

/// Linux kernel constant: `IP_TRANSPARENT` socket option (`SOL_IP` level)
pub const IP_TRANSPARENT: libc::c_int = 19;

/// Linux kernel constant: `IP_RECVORIGDSTADDR` (`SOL_IP` level)
pub const IP_RECVORIGDSTADDR: libc::c_int = 20;

/// Creates the sockets the interceptor needs
pub trait SocketProvider: Send + Sync + fmt::Debug {
    /// Bound, non-blocking TCP socket ready for `listen`
    ///
    /// # Errors
    /// Socket creation, option or bind failures.
    fn tcp_listener(&self, addr: SocketAddr) -> Result<Socket, TproxyError>;

    /// Bound, non-blocking UDP socket reporting original destinations
    ///
    /// # Errors
    /// Socket creation, option or bind failures.
    fn udp_listener(&self, addr: SocketAddr) -> Result<Socket, UdpError>;

    /// Fake dial: a UDP socket that looks like `original_dst` to `client`.
    ///
    /// Bound to the original destination and connected to the client, so
    /// replies carry the address the client expects and later datagrams of
    /// the flow are delivered to this socket instead of the listener.
    ///
    /// # Errors
    /// Socket creation, option, bind or connect failures.
    fn fake_dial(&self, original_dst: SocketAddr, client: SocketAddr) -> Result<Socket, UdpError>;
}

/// Real TPROXY sockets; needs `CAP_NET_ADMIN`
#[derive(Debug, Clone, Default)]
pub struct RealSocketProvider;

impl RealSocketProvider {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl SocketProvider for RealSocketProvider {
    fn tcp_listener(&self, addr: SocketAddr) -> Result<Socket, TproxyError> {
        let socket = create_tproxy_tcp_socket()?;
        socket
            .bind(&addr.into())
            .map_err(|e| TproxyError::bind(addr, e.to_string()))?;
        Ok(socket)
    }

    fn udp_listener(&self, addr: SocketAddr) -> Result<Socket, UdpError> {
        let socket = create_tproxy_udp_socket().map_err(|e| match e {
            TproxyError::PermissionDenied => UdpError::PermissionDenied,
            TproxyError::SocketOption { option, reason } => UdpError::SocketOption { option, reason },
            other => UdpError::socket_option("create", other.to_string()),
        })?;
        socket
            .bind(&addr.into())
            .map_err(|e| UdpError::socket_option("bind", format!("Failed to bind to {addr}: {e}")))?;
        Ok(socket)
    }

    fn fake_dial(&self, original_dst: SocketAddr, client: SocketAddr) -> Result<Socket, UdpError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| {
            UdpError::reply_socket(original_dst, format!("Failed to create socket: {e}"))
        })?;

        set_ip_transparent(&socket).map_err(|e| {
            UdpError::reply_socket(original_dst, format!("Failed to set IP_TRANSPARENT: {e}"))
        })?;

        // several clients may talk to the same destination
        socket.set_reuse_address(true).map_err(|e| {
            UdpError::reply_socket(original_dst, format!("Failed to set SO_REUSEADDR: {e}"))
        })?;

        socket.bind(&original_dst.into()).map_err(|e| {
            UdpError::reply_socket(
                original_dst,
                format!("Failed to bind (need CAP_NET_ADMIN): {e}"),
            )
        })?;

        socket.connect(&client.into()).map_err(|e| {
            UdpError::reply_socket(original_dst, format!("Failed to connect to {client}: {e}"))
        })?;

        socket.set_nonblocking(true).map_err(|e| {
            UdpError::reply_socket(original_dst, format!("Failed to set non-blocking: {e}"))
        })?;

        debug!("Fake dial {} <-> {}", original_dst, client);
        Ok(socket)
    }
}

/// Plain sockets without `IP_TRANSPARENT`.
///
/// Only traffic addressed to the listener itself is seen, so the "original
/// destination" is always the listen address. The fake dial binds an
/// ephemeral loopback port instead of the destination.
#[derive(Debug, Clone, Default)]
pub struct PlainSocketProvider;

impl PlainSocketProvider {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl SocketProvider for PlainSocketProvider {
    fn tcp_listener(&self, addr: SocketAddr) -> Result<Socket, TproxyError> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| TproxyError::SocketCreation(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| TproxyError::socket_option("SO_REUSEADDR", e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TproxyError::socket_option("O_NONBLOCK", e.to_string()))?;
        socket
            .bind(&addr.into())
            .map_err(|e| TproxyError::bind(addr, e.to_string()))?;
        Ok(socket)
    }

    fn udp_listener(&self, addr: SocketAddr) -> Result<Socket, UdpError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| UdpError::socket_option("create", e.to_string()))?;
        set_ip_recvorigdstaddr(&socket)
            .map_err(|e| UdpError::socket_option("IP_RECVORIGDSTADDR", e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| UdpError::socket_option("O_NONBLOCK", e.to_string()))?;
        socket
            .bind(&addr.into())
            .map_err(|e| UdpError::socket_option("bind", format!("Failed to bind to {addr}: {e}")))?;
        Ok(socket)
    }

    fn fake_dial(&self, original_dst: SocketAddr, client: SocketAddr) -> Result<Socket, UdpError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| {
            UdpError::reply_socket(original_dst, format!("Failed to create socket: {e}"))
        })?;
        let local = SocketAddr::new(client.ip(), 0);
        socket
            .bind(&local.into())
            .map_err(|e| UdpError::reply_socket(original_dst, format!("Failed to bind: {e}")))?;
        socket.connect(&client.into()).map_err(|e| {
            UdpError::reply_socket(original_dst, format!("Failed to connect to {client}: {e}"))
        })?;
        socket.set_nonblocking(true).map_err(|e| {
            UdpError::reply_socket(original_dst, format!("Failed to set non-blocking: {e}"))
        })?;
        Ok(socket)
    }
}

/// Production provider
#[must_use]
pub fn default_socket_provider() -> Arc<dyn SocketProvider> {
    Arc::new(RealSocketProvider::new())
}

/// Create a TCP socket with `IP_TRANSPARENT` enabled.
///
/// # Errors
///
/// Returns `TproxyError::SocketCreation` if socket creation fails.
/// Returns `TproxyError::PermissionDenied` without `CAP_NET_ADMIN`.
pub fn create_tproxy_tcp_socket() -> Result<Socket, TproxyError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| TproxyError::SocketCreation(e.to_string()))?;

    set_ip_transparent(&socket)?;

    // Enable SO_REUSEADDR for quick restart
    socket
        .set_reuse_address(true)
        .map_err(|e| TproxyError::socket_option("SO_REUSEADDR", e.to_string()))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| TproxyError::socket_option("O_NONBLOCK", e.to_string()))?;

    debug!("Created TPROXY TCP socket with IP_TRANSPARENT enabled");
    Ok(socket)
}

/// Create a UDP socket with `IP_TRANSPARENT` and `IP_RECVORIGDSTADDR` enabled.
///
/// # Errors
///
/// Returns `TproxyError` if socket creation or option setting fails.
pub fn create_tproxy_udp_socket() -> Result<Socket, TproxyError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TproxyError::SocketCreation(e.to_string()))?;

    set_ip_transparent(&socket)?;
    set_ip_recvorigdstaddr(&socket)?;

    socket
        .set_reuse_address(true)
        .map_err(|e| TproxyError::socket_option("SO_REUSEADDR", e.to_string()))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| TproxyError::socket_option("O_NONBLOCK", e.to_string()))?;

    debug!("Created TPROXY UDP socket with IP_TRANSPARENT and IP_RECVORIGDSTADDR");
    Ok(socket)
}

fn set_sol_ip_flag(socket: &Socket, option: libc::c_int) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    let one: libc::c_int = 1;

    #[allow(clippy::cast_possible_truncation)]
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_IP,
            option,
            std::ptr::addr_of!(one).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set `IP_TRANSPARENT`.
///
/// # Errors
///
/// Returns `TproxyError::PermissionDenied` if `CAP_NET_ADMIN` is missing,
/// `TproxyError::SocketOption` for any other setsockopt failure.
fn set_ip_transparent(socket: &Socket) -> Result<(), TproxyError> {
    set_sol_ip_flag(socket, IP_TRANSPARENT).map_err(|err| {
        if err.raw_os_error() == Some(libc::EPERM) {
            TproxyError::PermissionDenied
        } else {
            TproxyError::socket_option("IP_TRANSPARENT", err.to_string())
        }
    })
}

fn set_ip_recvorigdstaddr(socket: &Socket) -> Result<(), TproxyError> {
    set_sol_ip_flag(socket, IP_RECVORIGDSTADDR)
        .map_err(|err| TproxyError::socket_option("IP_RECVORIGDSTADDR", err.to_string()))
}

/// Whether `IP_TRANSPARENT` can be set in this process
#[must_use]
pub fn has_net_admin_capability() -> bool {
    !matches!(create_tproxy_tcp_socket(), Err(TproxyError::PermissionDenied))
}

/// Check if running as root (effective UID = 0).
#[must_use]
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(IP_TRANSPARENT, 19);
        assert_eq!(IP_RECVORIGDSTADDR, 20);
    }

    #[test]
    fn test_socket_creation_without_cap() {
        match create_tproxy_tcp_socket() {
            Ok(_) | Err(TproxyError::PermissionDenied) => {}
            Err(e) => panic!("Unexpected error: {e}"),
        }
    }

    #[test]
    fn test_real_fake_dial_needs_privilege() {
        let provider = RealSocketProvider::new();
        let dst: SocketAddr = "8.8.8.8:53".parse().unwrap();
        let client: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        match provider.fake_dial(dst, client) {
            Ok(socket) => {
                let local = socket.local_addr().unwrap().as_socket().unwrap();
                assert_eq!(local, dst);
            }
            Err(e) => assert!(matches!(e, UdpError::ReplySocketError { addr, .. } if addr == dst)),
        }
    }

    #[test]
    fn test_plain_provider_sockets() {
        let provider = PlainSocketProvider::new();
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let tcp = provider.tcp_listener(any).unwrap();
        assert!(tcp.local_addr().unwrap().as_socket().unwrap().port() > 0);

        let udp = provider.udp_listener(any).unwrap();
        let udp_addr = udp.local_addr().unwrap().as_socket().unwrap();

        let client: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let reply = provider.fake_dial(udp_addr, client).unwrap();
        assert_eq!(reply.peer_addr().unwrap().as_socket().unwrap(), client);
    }

    #[test]
    fn test_provider_trait_object() {
        let provider: Arc<dyn SocketProvider> = Arc::new(PlainSocketProvider::new());
        assert!(provider.udp_listener("127.0.0.1:0".parse().unwrap()).is_ok());
        let _ = default_socket_provider();
        let _ = has_net_admin_capability();
        let _ = is_root();
    }
}
