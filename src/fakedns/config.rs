//! Fake-IP resolver settings

use ipnet::Ipv4Net;

use crate::config::FakeDnsSection;

/// Configuration for the fake-IP resolver
#[derive(Debug, Clone)]
pub struct FakeDnsConfig {
    /// Whether the responder runs at all
    pub enabled: bool,
    /// Block fake addresses are allocated from
    ///
    /// Default: 198.18.0.0/15 (benchmarking range, never routed)
    pub ipv4_pool: Ipv4Net,
    /// Capacity of the forward (domain -> IP) LRU
    ///
    /// Default: 65536
    pub max_entries: u64,
}

impl Default for FakeDnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ipv4_pool: "198.18.0.0/15".parse().expect("valid IPv4 CIDR"),
            max_entries: 65536,
        }
    }
}

impl FakeDnsConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the IPv4 address pool
    #[must_use]
    pub fn with_ipv4_pool(mut self, pool: Ipv4Net) -> Self {
        self.ipv4_pool = pool;
        self
    }

    /// Set the forward cache capacity
    #[must_use]
    pub fn with_max_entries(mut self, max: u64) -> Self {
        self.max_entries = max;
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

impl From<&FakeDnsSection> for FakeDnsConfig {
    fn from(section: &FakeDnsSection) -> Self {
        Self {
            enabled: section.enabled,
            ipv4_pool: section.ipv4_pool,
            max_entries: section.max_entries,
        }
    }
}
