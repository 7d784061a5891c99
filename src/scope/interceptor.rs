//! Accept and receive loops of one scope
//!
//! TCP: each accepted connection's local address is the original
//! destination, its peer the real client. UDP: each datagram carries its
//! original destination in a control message; the first datagram of a flow
//! opens a fake-dial socket and a SOCKS5 UDP handler, later ones that still
//! reach the listener are handed to that handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{ProxyServer, ProxyType, ScopeKind};
use crate::fakedns::FakeIpResolver;
use crate::tproxy::{TproxyConnection, TproxyListener, TproxyUdpListener, UdpPacketInfo};
use crate::tunnel::{HandlerKey, HandlerRegistry, TargetAddr, TunnelHandler, TunnelTimeouts};

/// Pause after a failed accept so fd exhaustion does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Receive buffer for one redirected datagram
const UDP_BUFFER_SIZE: usize = 65535;

/// Dispatches intercepted flows of one scope to tunnel handlers
#[derive(Debug)]
pub struct Interceptor {
    scope: ScopeKind,
    proxy_type: ProxyType,
    server: ProxyServer,
    timeouts: TunnelTimeouts,
    registry: Arc<HandlerRegistry>,
    resolver: Option<Arc<FakeIpResolver>>,
    stopping: Arc<AtomicBool>,
}

impl Interceptor {
    #[must_use]
    pub fn new(
        scope: ScopeKind,
        proxy_type: ProxyType,
        server: ProxyServer,
        timeouts: TunnelTimeouts,
        registry: Arc<HandlerRegistry>,
        resolver: Option<Arc<FakeIpResolver>>,
        stopping: Arc<AtomicBool>,
    ) -> Self {
        Self {
            scope,
            proxy_type,
            server,
            timeouts,
            registry,
            resolver,
            stopping,
        }
    }

    fn handler(&self, key: HandlerKey) -> Arc<TunnelHandler> {
        let target = TargetAddr::from_original(key.dst, self.resolver.as_deref());
        TunnelHandler::new(
            self.scope,
            key,
            target,
            self.proxy_type,
            self.server.clone(),
            self.timeouts,
            Arc::clone(&self.registry),
        )
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Accept until cancelled, then close this scope's handlers
    pub async fn run_tcp(self: Arc<Self>, listener: TproxyListener, cancel: CancellationToken) {
        info!("{} TCP interception on {}", self.scope, listener.listen_addr());
        loop {
            let accepted = tokio::select! {
                () = cancel.cancelled() => break,
                r = listener.accept() => r,
            };
            match accepted {
                Ok(conn) => self.dispatch_tcp(conn),
                Err(e) => {
                    if self.stopping() {
                        break;
                    }
                    warn!("{} accept error: {}", self.scope, e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        let closed = self.registry.clear_scope(self.scope);
        info!("{} TCP interception stopped ({} tunnels closed)", self.scope, closed);
    }

    fn dispatch_tcp(&self, conn: TproxyConnection) {
        let key = HandlerKey::new(conn.client_addr(), conn.original_dst());
        let handler = self.handler(key);
        if let Err(e) = self.registry.try_insert(Arc::clone(&handler)) {
            debug!("Dropping connection: {}", e);
            return;
        }
        debug!("{} TCP {} -> {}", self.scope, key, handler.target());
        tokio::spawn(handler.run_tcp(conn.into_stream()));
    }

    /// Receive until cancelled, then close this scope's handlers
    pub async fn run_udp(self: Arc<Self>, listener: TproxyUdpListener, cancel: CancellationToken) {
        info!("{} UDP interception on {}", self.scope, listener.listen_addr());
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => break,
                r = listener.recv(&mut buf) => r,
            };
            match received {
                Ok(packet) => self.dispatch_udp(&listener, packet),
                Err(e) => {
                    if self.stopping() {
                        break;
                    }
                    // original destination missing: drop and go on
                    debug!("{} UDP receive error: {}", self.scope, e);
                }
            }
        }
        let closed = self.registry.clear_scope(self.scope);
        info!("{} UDP interception stopped ({} flows closed)", self.scope, closed);
    }

    fn dispatch_udp(&self, listener: &TproxyUdpListener, packet: UdpPacketInfo) {
        let key = HandlerKey::new(packet.client_addr, packet.original_dst);

        if let Some(existing) = self.registry.get(self.scope, &key) {
            if !existing.forward_datagram(packet.data) {
                trace!("{}: late datagram dropped", key);
            }
            return;
        }

        let handler = self.handler(key);
        if let Err(e) = self.registry.try_insert(Arc::clone(&handler)) {
            debug!("Dropping datagram: {}", e);
            return;
        }

        let socket = match listener.fake_dial(packet.original_dst, packet.client_addr) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("{} UDP {}: {}", self.scope, key, e);
                handler.close();
                return;
            }
        };
        debug!("{} UDP {} -> {}", self.scope, key, handler.target());
        tokio::spawn(handler.run_udp(socket, packet.data));
    }
}
