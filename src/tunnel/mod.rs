//! Upstream proxy tunnels
//!
//! Each intercepted flow gets a [`TunnelHandler`] that dials the scope's
//! upstream proxy and negotiates a tunnel to the flow's original
//! destination:
//!
//! - HTTP: `CONNECT host:port` with optional Basic proxy auth
//! - SOCKS4: IPv4 CONNECT, domain targets resolved locally
//! - SOCKS5: CONNECT with optional RFC 1929 auth
//! - SOCKS5 UDP: UDP ASSOCIATE, datagrams wrapped in the RFC 1928 envelope
//!
//! Live handlers are tracked in a [`HandlerRegistry`] keyed by scope and
//! [`HandlerKey`].

mod address;
mod common;
mod handler;
pub mod http;
mod registry;
pub mod socks4;
pub mod socks5;
pub mod socks5_udp;

pub use address::{HandlerKey, TargetAddr};
pub use common::{reply_message, TunnelTimeouts};
pub use handler::{TunnelHandler, TunnelState};
pub use registry::HandlerRegistry;
pub use socks5_udp::{Socks5UdpAssociation, Socks5UdpRelay};

pub use crate::config::{ProxyServer, ProxyType};
