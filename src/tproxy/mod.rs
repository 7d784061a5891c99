//! TPROXY module for transparent proxying
//!
//! Sockets, listeners and the UDP fake dial used by the interceptor.
//!
//! # IPv4 Only
//!
//! Original destinations are recovered for IPv4 only (`IP_RECVORIGDSTADDR`
//! and `sockaddr_in`).
//!
//! # Requirements
//!
//! - Linux kernel with TPROXY support and the `xt_TPROXY` module
//! - `CAP_NET_ADMIN` capability (or root)
//! - policy routing for the scope's fwmark:
//!
//! ```bash
//! ip rule add fwmark 8090 lookup 100
//! ip route add local 0.0.0.0/0 dev lo table 100
//! sysctl -w net.ipv4.conf.all.route_localnet=1
//! ```
//!
//! | Setting | Purpose |
//! |---------|---------|
//! | `route_localnet=1` | TPROXY `--on-ip 127.0.0.1` targets loopback, which the kernel otherwise treats as martian. |
//! | `ip rule` / `ip route` | Marked packets must be routed locally to reach the listener. |

mod connection;
mod listener;
mod socket;
mod udp_listener;

pub use connection::TproxyConnection;
pub use listener::TproxyListener;
pub use socket::{
    create_tproxy_tcp_socket, create_tproxy_udp_socket, default_socket_provider,
    has_net_admin_capability, is_root, PlainSocketProvider, RealSocketProvider, SocketProvider,
    IP_RECVORIGDSTADDR, IP_TRANSPARENT,
};
pub use udp_listener::{TproxyUdpListener, UdpPacketInfo};
