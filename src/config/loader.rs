//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: {} scopes ({} enabled), fake_dns={}",
        config.scopes.len(),
        config.enabled_scopes().count(),
        config.fake_dns.enabled
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `RUST_PROCPROXY_LOG_LEVEL`: Override log level
/// - `RUST_PROCPROXY_CGROUP_ROOT`: Override the cgroup v2 mount point
/// - `RUST_PROCPROXY_IPTABLES`: Override the packet-filter binary
/// - `RUST_PROCPROXY_DNS_LISTEN`: Override the fake DNS listen address
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;

    if let Ok(level) = std::env::var("RUST_PROCPROXY_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Ok(root) = std::env::var("RUST_PROCPROXY_CGROUP_ROOT") {
        config.cgroup_root = root.into();
        debug!("cgroup root overridden to {:?}", config.cgroup_root);
    }

    if let Ok(bin) = std::env::var("RUST_PROCPROXY_IPTABLES") {
        config.iptables_bin = bin;
        debug!("iptables binary overridden to {}", config.iptables_bin);
    }

    if let Ok(addr) = std::env::var("RUST_PROCPROXY_DNS_LISTEN") {
        config.fake_dns.listen = addr.parse().map_err(|_| ConfigError::EnvError {
            name: "RUST_PROCPROXY_DNS_LISTEN".into(),
            reason: format!("Invalid socket address: {addr}"),
        })?;
        debug!("Fake DNS listen overridden to {}", config.fake_dns.listen);
    }

    // Re-validate after overrides
    config.validate()?;

    Ok(config)
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
