//! Fake-IP resolver: allocation plus the bidirectional cache

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::cache::FakeIpCache;
use super::config::FakeDnsConfig;
use super::pool::Ipv4Pool;

/// Maps domain names to synthetic addresses and back
#[derive(Debug)]
pub struct FakeIpResolver {
    cache: FakeIpCache,
    pool: Ipv4Pool,
    /// Serialises miss -> allocate -> insert so one domain gets one address
    allocation: Mutex<()>,
}

impl FakeIpResolver {
    #[must_use]
    pub fn new(config: &FakeDnsConfig) -> Self {
        Self {
            cache: FakeIpCache::new(config.max_entries),
            pool: Ipv4Pool::new(config.ipv4_pool),
            allocation: Mutex::new(()),
        }
    }

    /// Address for `domain`, allocating one on first sight.
    ///
    /// Never fails: once the pool is exhausted the offset wraps and the
    /// previous owner of the recycled address is evicted.
    pub fn resolve_domain(&self, domain: &str) -> Ipv4Addr {
        if let Some(ip) = self.cache.get_by_domain(domain) {
            trace!("fakedns cache hit: {} -> {}", domain, ip);
            return ip;
        }

        let _guard = self.allocation.lock();
        if let Some(ip) = self.cache.get_by_domain(domain) {
            return ip;
        }

        let (ip, wrapped) = self.pool.next();
        if wrapped {
            if let Some(previous) = self.cache.reverse_owner(ip) {
                // the previous owner may since have moved to another address
                if self.cache.maps_to(&previous, ip) {
                    self.cache.forget(&previous);
                }
                debug!("fakedns recycling {} from {} to {}", ip, previous, domain);
                self.cache.stats().recycled.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.cache.add(domain, ip);
        self.cache.stats().allocations.fetch_add(1, Ordering::Relaxed);
        trace!("fakedns allocated: {} -> {}", domain, ip);
        ip
    }

    /// Record an explicit mapping in both directions
    pub fn add(&self, domain: &str, ip: Ipv4Addr) {
        self.cache.add(domain, ip);
    }

    /// Domain behind a fake address, if still live
    #[must_use]
    pub fn get_by_ip(&self, ip: IpAddr) -> Option<String> {
        match ip {
            IpAddr::V4(v4) if self.pool.contains(v4) => self.cache.get_by_ip(v4),
            _ => None,
        }
    }

    /// Whether `ip` lies in the fake block
    #[must_use]
    pub fn is_fake_ip(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.pool.contains(v4),
            IpAddr::V6(_) => false,
        }
    }

    /// Forward entry of `domain`, if live
    #[must_use]
    pub fn lookup_domain(&self, domain: &str) -> Option<Ipv4Addr> {
        self.cache.get_by_domain(domain)
    }

    /// Drop the forward entry of `domain` as if the LRU had evicted it
    pub fn forget(&self, domain: &str) {
        self.cache.forget(domain);
    }

    #[must_use]
    pub fn cache(&self) -> &FakeIpCache {
        &self.cache
    }

    #[must_use]
    pub fn pool(&self) -> &Ipv4Pool {
        &self.pool
    }
}
