//! Fake-IP DNS responder
//!
//! Answers A queries with a synthetic address from a configured block and
//! remembers which domain each address was handed to. When a redirected flow
//! later arrives for one of those addresses, the interceptor asks the
//! resolver for the domain and tunnels by name instead of by address.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rust_procproxy::fakedns::{FakeDns, FakeDnsConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let fakedns = FakeDns::builder("127.0.0.1:1053".parse()?)
//!     .config(FakeDnsConfig::new().with_max_entries(65536))
//!     .build()
//!     .await?;
//! let resolver = fakedns.resolver().clone();
//! tokio::spawn(fakedns.run(CancellationToken::new()));
//! ```

pub mod cache;
pub mod config;
pub mod pool;
mod processor;
pub mod resolver;
pub mod server;
mod udp_server;

pub use cache::{FakeIpCache, FakeIpCacheStats, FakeIpCacheStatsSnapshot};
pub use config::FakeDnsConfig;
pub use pool::Ipv4Pool;
pub use processor::{handle_dns_request, FAKE_TTL};
pub use resolver::FakeIpResolver;
pub use server::{FakeDns, FakeDnsBuilder};
