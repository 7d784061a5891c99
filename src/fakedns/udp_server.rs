//! FakeDNS UDP server

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::processor::handle_dns_request;
use super::resolver::FakeIpResolver;

/// DNS-over-UDP responder backed by a [`FakeIpResolver`]
#[derive(Debug)]
pub struct FakeDnsUdpServer {
    socket: UdpSocket,
    resolver: Arc<FakeIpResolver>,
}

impl FakeDnsUdpServer {
    /// Bind to `addr`
    ///
    /// # Errors
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr, resolver: Arc<FakeIpResolver>) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket, resolver })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve requests until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        // EDNS allows up to 65535 bytes
        let mut buffer = vec![0u8; 65535];

        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => break,
                r = self.socket.recv_from(&mut buffer) => r,
            };
            let (n, peer_addr) = match received {
                Ok(r) => r,
                Err(err) => {
                    error!("FakeDNS UDP recv error: {}", err);
                    time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            trace!("FakeDNS UDP received {} bytes from {}", n, peer_addr);

            let req_message = match Message::from_vec(&buffer[..n]) {
                Ok(m) => m,
                Err(err) => {
                    debug!("FakeDNS UDP parse error from {}: {}", peer_addr, err);
                    continue;
                }
            };

            let rsp_buffer = match handle_dns_request(&req_message, &self.resolver).to_vec() {
                Ok(buf) => buf,
                Err(err) => {
                    error!("FakeDNS response encode error: {}", err);
                    continue;
                }
            };

            if let Err(err) = self.socket.send_to(&rsp_buffer, peer_addr).await {
                debug!("FakeDNS UDP send error to {}: {}", peer_addr, err);
            }
        }
        debug!("FakeDNS UDP server stopped");
    }
}
