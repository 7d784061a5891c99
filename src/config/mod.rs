//! Configuration module for rust-procproxy
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use rust_procproxy::config::load_config;
//!
//! let config = load_config("/etc/rust-procproxy/config.json").unwrap();
//! for scope in config.enabled_scopes() {
//!     println!("{} -> {}:{}", scope.scope, scope.proxy_type, scope.proxy_name);
//! }
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    Config, FakeDnsSection, LogConfig, ProxyServer, ProxyType, ScopeConfig, ScopeKind,
};
