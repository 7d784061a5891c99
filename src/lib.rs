//! rust-procproxy: per-process transparent proxy daemon
//!
//! Selected programs have their TCP/UDP traffic redirected to an upstream
//! HTTP CONNECT, SOCKS4 or SOCKS5 proxy without their cooperation.
//!
//! # Architecture
//!
//! ```text
//! process → cgroup v2 slice → iptables mangle MARK → TPROXY → listener
//!                                                               ↓
//!                                           HTTP / SOCKS4 / SOCKS5 handshake
//!                                                               ↓
//!                                                        upstream proxy
//! ```
//!
//! A fake-IP DNS responder hands out synthetic addresses so that flows to
//! them can be tunnelled by domain name.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rust_procproxy::cgroup::ControllerManager;
//! use rust_procproxy::config::load_config;
//! use rust_procproxy::iptables::{FilterSession, IptablesExecutor};
//! use rust_procproxy::scope::{ProxyScope, ScopeContext};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/rust-procproxy/config.json")?;
//!
//! let session = Arc::new(FilterSession::new(Arc::new(IptablesExecutor::new(
//!     config.iptables_bin.clone(),
//! ))));
//! let controllers = Arc::new(ControllerManager::new(&config.cgroup_root));
//! let ctx = ScopeContext::new(session, controllers);
//!
//! for cfg in config.enabled_scopes() {
//!     let mut scope = ProxyScope::new(cfg.clone(), ctx.clone());
//!     scope.start()?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cgroup`]: process classification controllers
//! - [`config`]: configuration types and loading
//! - [`error`]: error types
//! - [`fakedns`]: fake-IP DNS responder and resolver
//! - [`iptables`]: in-memory mirror of the mangle rules
//! - [`scope`]: proxy scope lifecycle and interception loops
//! - [`tproxy`]: TPROXY sockets and listeners
//! - [`tunnel`]: upstream handshakes and relays

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod cgroup;
pub mod config;
pub mod error;
pub mod fakedns;
pub mod iptables;
pub mod scope;
pub mod tproxy;
pub mod tunnel;

pub use config::{Config, ProxyServer, ProxyType, ScopeConfig, ScopeKind};
pub use error::{
    CgroupError, ConfigError, FakeDnsError, FilterError, ProcProxyError, TproxyError, TunnelError,
    UdpError,
};
pub use scope::{ProxyScope, ScopeContext};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if running with required capabilities for TPROXY
///
/// # Errors
///
/// Returns `TproxyError::PermissionDenied` without `CAP_NET_ADMIN`.
pub fn check_capabilities() -> Result<(), TproxyError> {
    if !tproxy::has_net_admin_capability() {
        return Err(TproxyError::PermissionDenied);
    }
    Ok(())
}
