//! Per-flow tunnel state machine
//!
//! One [`TunnelHandler`] exists per intercepted TCP connection or UDP flow.
//! It dials the upstream proxy, runs the protocol handshake, then relays
//! bytes until either side closes. [`TunnelHandler::close`] may be called
//! from any task any number of times; only the first call has effect.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::address::{HandlerKey, TargetAddr};
use super::common::{dial, with_deadline, TunnelTimeouts};
use super::http::http_connect;
use super::registry::HandlerRegistry;
use super::socks4::socks4_connect;
use super::socks5::socks5_connect;
use super::socks5_udp::{decapsulate, Socks5UdpAssociation};
use crate::config::{ProxyServer, ProxyType, ScopeKind};
use crate::error::TunnelError;

/// Late datagrams queued for a UDP flow before its reply socket takes over
const INBOX_CAPACITY: usize = 64;

/// Largest UDP payload relayed
const MAX_DATAGRAM: usize = 65535;

/// Lifecycle of one tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelState {
    Created = 0,
    Dialing = 1,
    Handshaking = 2,
    Established = 3,
    Closed = 4,
}

impl TunnelState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Dialing,
            2 => Self::Handshaking,
            3 => Self::Established,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Dialing => "dialing",
            Self::Handshaking => "handshaking",
            Self::Established => "established",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A tunnel through the scope's upstream proxy for one [`HandlerKey`]
pub struct TunnelHandler {
    scope: ScopeKind,
    key: HandlerKey,
    target: TargetAddr,
    proxy_type: ProxyType,
    server: ProxyServer,
    timeouts: TunnelTimeouts,
    state: AtomicU8,
    closed: AtomicBool,
    cancel: CancellationToken,
    registry: Arc<HandlerRegistry>,
    inbox_tx: mpsc::Sender<Bytes>,
    inbox_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
}

impl fmt::Debug for TunnelHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelHandler")
            .field("scope", &self.scope)
            .field("key", &self.key)
            .field("target", &self.target)
            .field("proxy_type", &self.proxy_type)
            .field("server", &self.server.address())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TunnelHandler {
    #[must_use]
    pub fn new(
        scope: ScopeKind,
        key: HandlerKey,
        target: TargetAddr,
        proxy_type: ProxyType,
        server: ProxyServer,
        timeouts: TunnelTimeouts,
        registry: Arc<HandlerRegistry>,
    ) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        Arc::new(Self {
            scope,
            key,
            target,
            proxy_type,
            server,
            timeouts,
            state: AtomicU8::new(TunnelState::Created as u8),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            registry,
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
        })
    }

    #[must_use]
    pub const fn scope(&self) -> ScopeKind {
        self.scope
    }

    #[must_use]
    pub const fn key(&self) -> &HandlerKey {
        &self.key
    }

    #[must_use]
    pub const fn target(&self) -> &TargetAddr {
        &self.target
    }

    #[must_use]
    pub fn state(&self) -> TunnelState {
        TunnelState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn set_state(&self, state: TunnelState) {
        // never leave Closed
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur != TunnelState::Closed as u8).then_some(state as u8)
            });
    }

    async fn dial_upstream(&self) -> Result<TcpStream, TunnelError> {
        self.set_state(TunnelState::Dialing);
        dial(&self.server.address(), self.timeouts.dial).await
    }

    /// Dial the proxy and negotiate a TCP tunnel to the target.
    ///
    /// Returns the upstream stream plus any tunnelled bytes the proxy sent
    /// along with its handshake reply.
    ///
    /// # Errors
    /// Dial, timeout or protocol failures.
    pub async fn establish_tcp(&self) -> Result<(TcpStream, Vec<u8>), TunnelError> {
        let mut upstream = self.dial_upstream().await?;
        self.set_state(TunnelState::Handshaking);

        let addr = self.server.address();
        let credentials = self.server.credentials();
        let leftover = with_deadline(self.timeouts.handshake, &addr, async {
            match self.proxy_type {
                ProxyType::Http => http_connect(&mut upstream, &self.target, credentials).await,
                ProxyType::Sock4 => {
                    socks4_connect(&mut upstream, &self.target, self.server.user.as_deref())
                        .await
                        .map(|()| Vec::new())
                }
                ProxyType::Sock5 => socks5_connect(&mut upstream, &self.target, credentials)
                    .await
                    .map(|_| Vec::new()),
            }
        })
        .await?;

        self.set_state(TunnelState::Established);
        debug!(
            "{} tunnel {} established via {} {}",
            self.scope, self.key, self.proxy_type, addr
        );
        Ok((upstream, leftover))
    }

    /// Dial the proxy and negotiate a UDP association
    ///
    /// # Errors
    /// Non-SOCKS5 proxies, dial, timeout or protocol failures.
    pub async fn establish_udp(&self) -> Result<Socks5UdpAssociation, TunnelError> {
        if !self.proxy_type.supports_udp() {
            return Err(TunnelError::protocol(
                "UDP",
                format!("{} proxies cannot relay UDP", self.proxy_type),
            ));
        }
        let control = self.dial_upstream().await?;
        self.set_state(TunnelState::Handshaking);

        let addr = self.server.address();
        let assoc = with_deadline(
            self.timeouts.handshake,
            &addr,
            Socks5UdpAssociation::establish(control, self.server.credentials()),
        )
        .await?;

        self.set_state(TunnelState::Established);
        debug!(
            "{} UDP tunnel {} established, relay {}",
            self.scope,
            self.key,
            assoc.relay_addr()
        );
        Ok(assoc)
    }

    /// Relay between the client and an established upstream stream.
    ///
    /// Each direction runs on its own task; whichever finishes first closes
    /// the handler, which stops the other.
    pub async fn communicate_tcp(
        self: &Arc<Self>,
        client: TcpStream,
        upstream: TcpStream,
        leftover: Vec<u8>,
    ) {
        let (mut client_rd, mut client_wr) = client.into_split();
        let (mut upstream_rd, mut upstream_wr) = upstream.into_split();

        if !leftover.is_empty() {
            if let Err(e) = client_wr.write_all(&leftover).await {
                debug!("{}: failed to flush early payload: {}", self.key, e);
                self.close();
                return;
            }
        }

        let outbound = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let copied = tokio::select! {
                    () = this.cancel.cancelled() => Ok(0),
                    r = tokio::io::copy(&mut client_rd, &mut upstream_wr) => r,
                };
                let _ = upstream_wr.shutdown().await;
                this.close();
                copied
            })
        };
        let inbound = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let copied = tokio::select! {
                    () = this.cancel.cancelled() => Ok(0),
                    r = tokio::io::copy(&mut upstream_rd, &mut client_wr) => r,
                };
                let _ = client_wr.shutdown().await;
                this.close();
                copied
            })
        };

        let (sent, received) = tokio::join!(outbound, inbound);
        match (sent, received) {
            (Ok(Ok(tx)), Ok(Ok(rx))) => {
                debug!("{} closed: {} bytes up, {} bytes down", self.key, tx, rx);
            }
            (sent, received) => {
                trace!("{} closed: up {:?}, down {:?}", self.key, sent, received);
            }
        }
    }

    /// Relay datagrams between the fake-dial client socket and the
    /// association's relay, starting with `first`.
    ///
    /// Ends on cancellation, socket error, control connection EOF, or when
    /// no datagram moves in either direction for the idle timeout.
    pub async fn communicate_udp(
        self: &Arc<Self>,
        client: UdpSocket,
        assoc: Socks5UdpAssociation,
        first: Bytes,
    ) {
        let (mut control, relay) = assoc.into_parts();
        let mut inbox = self.inbox_rx.lock().take();

        if let Err(e) = relay.send_to(&self.target, &first).await {
            warn!("{}: failed to relay first datagram: {}", self.key, e);
            self.close();
            return;
        }

        let mut client_buf = vec![0u8; MAX_DATAGRAM];
        let mut relay_buf = vec![0u8; MAX_DATAGRAM];
        let mut control_buf = [0u8; 64];

        loop {
            let idle = tokio::time::sleep(self.timeouts.udp_idle);
            tokio::select! {
                () = self.cancel.cancelled() => break,
                r = client.recv(&mut client_buf) => match r {
                    Ok(n) => {
                        if let Err(e) = relay.send_to(&self.target, &client_buf[..n]).await {
                            debug!("{}: relay send failed: {}", self.key, e);
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("{}: client recv failed: {}", self.key, e);
                        break;
                    }
                },
                Some(data) = next_queued(&mut inbox) => {
                    if let Err(e) = relay.send_to(&self.target, &data).await {
                        debug!("{}: relay send failed: {}", self.key, e);
                        break;
                    }
                }
                r = relay.recv_raw(&mut relay_buf) => match r {
                    Ok(n) => match decapsulate(&relay_buf[..n]) {
                        Ok((from, payload)) => {
                            trace!("{}: {} bytes from {}", self.key, payload.len(), from);
                            if let Err(e) = client.send(payload).await {
                                debug!("{}: client send failed: {}", self.key, e);
                                break;
                            }
                        }
                        Err(e) => warn!("{}: dropping relay datagram: {}", self.key, e),
                    },
                    Err(e) => {
                        debug!("{}: relay recv failed: {}", self.key, e);
                        break;
                    }
                },
                r = control.read(&mut control_buf) => match r {
                    Ok(0) | Err(_) => {
                        debug!("{}: SOCKS5 control connection closed", self.key);
                        break;
                    }
                    Ok(n) => trace!("{}: ignoring {} bytes on control connection", self.key, n),
                },
                () = idle => {
                    debug!("{}: UDP flow idle for {:?}", self.key, self.timeouts.udp_idle);
                    break;
                }
            }
        }
        self.close();
    }

    /// Full TCP lifecycle: establish, relay, close
    pub async fn run_tcp(self: Arc<Self>, client: TcpStream) {
        match self.establish_tcp().await {
            Ok((upstream, leftover)) => self.communicate_tcp(client, upstream, leftover).await,
            Err(e) => {
                warn!("{} tunnel {} to {} failed: {}", self.scope, self.key, self.target, e);
                self.close();
            }
        }
    }

    /// Full UDP lifecycle: establish, relay, close
    pub async fn run_udp(self: Arc<Self>, client: UdpSocket, first: Bytes) {
        match self.establish_udp().await {
            Ok(assoc) => self.communicate_udp(client, assoc, first).await,
            Err(e) => {
                warn!("{} UDP tunnel {} to {} failed: {}", self.scope, self.key, self.target, e);
                self.close();
            }
        }
    }

    /// Queue a datagram that reached the listener instead of the flow's
    /// reply socket. Returns false if the flow is gone or backed up.
    pub fn forward_datagram(&self, data: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inbox_tx.try_send(data).is_ok()
    }

    /// Stop the tunnel and leave the registry.
    ///
    /// Returns true only for the call that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state.store(TunnelState::Closed as u8, Ordering::Release);
        self.cancel.cancel();
        self.registry.remove(self);
        debug!("{} tunnel {} closed", self.scope, self.key);
        true
    }
}

async fn next_queued(inbox: &mut Option<mpsc::Receiver<Bytes>>) -> Option<Bytes> {
    match inbox {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
