//! TPROXY UDP Listener
//!
//! UDP is connectionless: one listener socket receives every redirected
//! datagram, and the original destination of each arrives in an
//! `IP_RECVORIGDSTADDR` control message (IPv4 only).
//!
//! A flow is turned into a pseudo-connection with [`TproxyUdpListener::fake_dial`]:
//! a socket bound to the original destination and connected to the client.
//! The kernel prefers connected sockets when delivering TPROXY datagrams, so
//! after the fake dial the rest of the flow bypasses the listener.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tracing::{info, trace};

use super::socket::{SocketProvider, IP_RECVORIGDSTADDR};
use crate::error::UdpError;

/// Control message buffer, room for one `sockaddr_in` cmsg
const CMSG_BUFFER_SIZE: usize = 64;

/// One received datagram with its addressing
#[derive(Debug, Clone)]
pub struct UdpPacketInfo {
    pub data: Bytes,
    /// Real sender
    pub client_addr: SocketAddr,
    /// Where the sender addressed it
    pub original_dst: SocketAddr,
}

#[derive(Debug)]
pub struct TproxyUdpListener {
    socket: UdpSocket,
    listen_addr: SocketAddr,
    provider: Arc<dyn SocketProvider>,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
}

impl TproxyUdpListener {
    /// Create and bind a listener through `provider`.
    ///
    /// # Errors
    ///
    /// Returns `UdpError` if socket creation or binding fails, including
    /// `PermissionDenied` without `CAP_NET_ADMIN`.
    pub fn bind(addr: SocketAddr, provider: Arc<dyn SocketProvider>) -> Result<Self, UdpError> {
        info!("Creating TPROXY UDP listener on {}", addr);

        let socket = provider.udp_listener(addr)?;
        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(|e| {
            UdpError::socket_option("from_std", format!("Failed to convert socket: {e}"))
        })?;
        let listen_addr = socket.local_addr()?;

        info!("TPROXY UDP listener ready on {}", listen_addr);
        Ok(Self {
            socket,
            listen_addr,
            provider,
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        })
    }

    /// Receive one datagram together with its original destination.
    ///
    /// # Errors
    ///
    /// Returns `UdpError::RecvError` if recvmsg fails or the original
    /// destination is missing.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<UdpPacketInfo, UdpError> {
        let fd = self.socket.as_raw_fd();
        let (n, client_addr, original_dst) = self
            .socket
            .async_io(Interest::READABLE, || recv_with_original_dst(fd, buf))
            .await
            .map_err(|e| UdpError::RecvError(e.to_string()))?;

        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        trace!("UDP packet: {} -> {} ({} bytes)", client_addr, original_dst, n);

        Ok(UdpPacketInfo {
            data: Bytes::copy_from_slice(&buf[..n]),
            client_addr,
            original_dst,
        })
    }

    /// Open the pseudo-connection for a flow
    ///
    /// # Errors
    ///
    /// Returns `UdpError::ReplySocketError` if the socket cannot be created.
    pub fn fake_dial(
        &self,
        original_dst: SocketAddr,
        client: SocketAddr,
    ) -> Result<UdpSocket, UdpError> {
        let socket = self.provider.fake_dial(original_dst, client)?;
        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket)
            .map_err(|e| UdpError::reply_socket(original_dst, format!("from_std: {e}")))
    }

    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    #[must_use]
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

/// `recvmsg` plus `IP_RECVORIGDSTADDR` cmsg parsing.
///
/// Returns `(bytes_received, source_addr, original_dest_addr)`.
#[allow(clippy::cast_possible_truncation)] // socklen_t is always u32
#[allow(clippy::borrow_as_ptr)] // Required for libc FFI
#[allow(clippy::cast_ptr_alignment)] // CMSG_DATA alignment is handled by kernel
#[allow(clippy::cast_sign_loss)] // n is guaranteed positive after error check
fn recv_with_original_dst(
    fd: RawFd,
    buf: &mut [u8],
) -> Result<(usize, SocketAddr, SocketAddr), io::Error> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };

    let mut src_addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let src_addr_len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let mut cmsg_buf = [0u8; CMSG_BUFFER_SIZE];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(src_addr).cast::<libc::c_void>();
    msg.msg_namelen = src_addr_len;
    msg.msg_iov = std::ptr::addr_of_mut!(iov);
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = CMSG_BUFFER_SIZE;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    if (msg.msg_flags & libc::MSG_CTRUNC) != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Control message truncated (MSG_CTRUNC)",
        ));
    }

    let src_port = u16::from_be(src_addr.sin_port);
    let src_ip = Ipv4Addr::from(u32::from_be(src_addr.sin_addr.s_addr));
    let src = SocketAddr::V4(SocketAddrV4::new(src_ip, src_port));

    let mut original_dst: Option<SocketAddr> = None;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let cmsg_ref = unsafe { &*cmsg };
        if cmsg_ref.cmsg_level == libc::SOL_IP && cmsg_ref.cmsg_type == IP_RECVORIGDSTADDR {
            let addr_ptr = unsafe { libc::CMSG_DATA(cmsg) }.cast::<libc::sockaddr_in>();
            let addr = unsafe { std::ptr::read_unaligned(addr_ptr) };

            let dst_port = u16::from_be(addr.sin_port);
            let dst_ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            original_dst = Some(SocketAddr::V4(SocketAddrV4::new(dst_ip, dst_port)));
            break;
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }

    let dst = original_dst.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "Original destination not found in cmsg",
        )
    })?;

    Ok((n as usize, src, dst))
}
