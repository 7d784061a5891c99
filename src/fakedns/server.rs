//! FakeDNS server assembly

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::config::FakeDnsConfig;
use super::resolver::FakeIpResolver;
use super::udp_server::FakeDnsUdpServer;
use crate::error::FakeDnsError;

/// Builder for [`FakeDns`]
#[derive(Debug)]
pub struct FakeDnsBuilder {
    config: FakeDnsConfig,
    listen_addr: SocketAddr,
}

impl FakeDnsBuilder {
    #[must_use]
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            config: FakeDnsConfig::default(),
            listen_addr,
        }
    }

    #[must_use]
    pub fn config(mut self, config: FakeDnsConfig) -> Self {
        self.config = config;
        self
    }

    /// Create the resolver and bind the responder
    ///
    /// # Errors
    /// Returns `FakeDnsError::Bind` if the listen address is unavailable.
    pub async fn build(self) -> Result<FakeDns, FakeDnsError> {
        let resolver = Arc::new(FakeIpResolver::new(&self.config));
        let server = FakeDnsUdpServer::bind(self.listen_addr, resolver.clone())
            .await
            .map_err(|e| FakeDnsError::Bind {
                addr: self.listen_addr,
                reason: e.to_string(),
            })?;

        Ok(FakeDns {
            server,
            resolver,
            config: self.config,
        })
    }
}

/// Fake-IP DNS responder and its resolver
#[derive(Debug)]
pub struct FakeDns {
    server: FakeDnsUdpServer,
    resolver: Arc<FakeIpResolver>,
    config: FakeDnsConfig,
}

impl FakeDns {
    #[must_use]
    pub fn builder(listen_addr: SocketAddr) -> FakeDnsBuilder {
        FakeDnsBuilder::new(listen_addr)
    }

    /// Shared resolver, for IP -> domain lookups by the interceptor
    #[must_use]
    pub fn resolver(&self) -> &Arc<FakeIpResolver> {
        &self.resolver
    }

    #[must_use]
    pub fn config(&self) -> &FakeDnsConfig {
        &self.config
    }

    /// Bound UDP address
    ///
    /// # Errors
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Serve until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        if let Ok(addr) = self.server.local_addr() {
            info!(
                "FakeDNS UDP server listening on {} (pool {})",
                addr, self.config.ipv4_pool
            );
        }
        self.server.run(cancel).await;
    }
}
