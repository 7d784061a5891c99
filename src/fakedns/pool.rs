//! Fake address allocation
//!
//! Addresses are handed out at a monotonically increasing offset from the
//! first host of the block. Once the offset passes the last host it wraps to
//! the first again; the resolver is responsible for evicting whichever domain
//! held a recycled address.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use parking_lot::Mutex;

/// IPv4 block with a wrapping offset counter
#[derive(Debug)]
pub struct Ipv4Pool {
    network: Ipv4Net,
    first: u32,
    size: u64,
    /// Total allocations so far; the offset is this modulo `size`
    counter: Mutex<u64>,
}

impl Ipv4Pool {
    /// Create a pool over the host addresses of `network`
    #[must_use]
    pub fn new(network: Ipv4Net) -> Self {
        let total = 1u64 << (32 - u32::from(network.prefix_len()));
        // /31 and /32 have no network/broadcast pair to skip
        let (first, size) = if network.prefix_len() >= 31 {
            (u32::from(network.network()), total)
        } else {
            (u32::from(network.network()) + 1, total - 2)
        };
        Self {
            network,
            first,
            size,
            counter: Mutex::new(0),
        }
    }

    /// Next address, and whether the offset wrapped to get it
    pub fn next(&self) -> (Ipv4Addr, bool) {
        let mut counter = self.counter.lock();
        let wrapped = *counter >= self.size;
        let offset = *counter % self.size;
        *counter += 1;
        // offset < size <= 2^32
        let addr = self.first.wrapping_add(u32::try_from(offset).unwrap_or(0));
        (Ipv4Addr::from(addr), wrapped)
    }

    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.network.contains(&addr)
    }

    /// Number of allocatable addresses
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn network(&self) -> Ipv4Net {
        self.network
    }

    /// Allocations made so far (never decreases)
    #[must_use]
    pub fn allocated(&self) -> u64 {
        *self.counter.lock()
    }
}
