//! Bidirectional domain <-> fake IP cache
//!
//! - Domain -> IP lives in a bounded moka LRU and may be evicted at any time.
//! - IP -> Domain lives in a DashMap keyed by address, so it never holds more
//!   entries than the pool has addresses.
//!
//! The reverse map is never swept. A reverse hit whose domain no longer maps
//! back to the same address is stale: it is dropped on the spot and the
//! lookup misses.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tracing::trace;

/// Counters for the fake-IP cache
#[derive(Debug, Default)]
pub struct FakeIpCacheStats {
    /// Fresh addresses handed out
    pub allocations: AtomicU64,
    /// Forward lookups answered from the LRU
    pub hits: AtomicU64,
    /// Reverse entries dropped because their domain was evicted
    pub stale_repairs: AtomicU64,
    /// Addresses reused after the pool wrapped
    pub recycled: AtomicU64,
}

/// Point-in-time copy of [`FakeIpCacheStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeIpCacheStatsSnapshot {
    pub allocations: u64,
    pub hits: u64,
    pub stale_repairs: u64,
    pub recycled: u64,
}

impl FakeIpCacheStats {
    #[must_use]
    pub fn snapshot(&self) -> FakeIpCacheStatsSnapshot {
        FakeIpCacheStatsSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            stale_repairs: self.stale_repairs.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
        }
    }
}

/// Domain <-> IP mapping with lazy reverse repair
pub struct FakeIpCache {
    forward: Cache<String, Ipv4Addr>,
    reverse: DashMap<Ipv4Addr, String>,
    stats: FakeIpCacheStats,
}

impl std::fmt::Debug for FakeIpCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeIpCache")
            .field("forward", &self.forward.entry_count())
            .field("reverse", &self.reverse.len())
            .finish_non_exhaustive()
    }
}

impl FakeIpCache {
    /// Create a cache whose forward LRU holds at most `max_entries` domains
    #[must_use]
    pub fn new(max_entries: u64) -> Self {
        Self {
            // plain LRU: a full TinyLFU cache may refuse to admit a new
            // domain, which would hand it a fresh address on every query
            forward: Cache::builder()
                .max_capacity(max_entries)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            reverse: DashMap::new(),
            stats: FakeIpCacheStats::default(),
        }
    }

    /// Record `domain <-> ip` in both directions
    pub fn add(&self, domain: &str, ip: Ipv4Addr) {
        self.forward.insert(domain.to_string(), ip);
        self.reverse.insert(ip, domain.to_string());
    }

    /// Forward lookup; refreshes the entry's LRU position
    #[must_use]
    pub fn get_by_domain(&self, domain: &str) -> Option<Ipv4Addr> {
        let ip = self.forward.get(domain)?;
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(ip)
    }

    /// Reverse lookup with lazy repair
    #[must_use]
    pub fn get_by_ip(&self, ip: Ipv4Addr) -> Option<String> {
        let domain = self.reverse.get(&ip).map(|d| d.value().clone())?;
        if self.forward.get(&domain) == Some(ip) {
            return Some(domain);
        }

        // Only drop the entry we judged stale; a concurrent add may have
        // already replaced it.
        if self.reverse.remove_if(&ip, |_, d| *d == domain).is_some() {
            self.stats.stale_repairs.fetch_add(1, Ordering::Relaxed);
            trace!("fakedns pruned stale reverse entry {} -> {}", ip, domain);
        }
        None
    }

    /// Domain currently recorded for `ip`, without freshness checks
    #[must_use]
    pub fn reverse_owner(&self, ip: Ipv4Addr) -> Option<String> {
        self.reverse.get(&ip).map(|d| d.value().clone())
    }

    /// Whether `domain` currently maps to `ip`; not counted as a hit
    #[must_use]
    pub fn maps_to(&self, domain: &str, ip: Ipv4Addr) -> bool {
        self.forward.get(domain) == Some(ip)
    }

    /// Drop the forward entry of `domain`; its reverse entry goes stale
    pub fn forget(&self, domain: &str) {
        self.forward.invalidate(domain);
    }

    /// Reverse entries, stale ones included
    #[must_use]
    pub fn reverse_len(&self) -> usize {
        self.reverse.len()
    }

    /// Live forward entries
    #[must_use]
    pub fn forward_len(&self) -> u64 {
        self.forward.run_pending_tasks();
        self.forward.entry_count()
    }

    #[must_use]
    pub fn stats(&self) -> &FakeIpCacheStats {
        &self.stats
    }
}
