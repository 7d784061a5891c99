//! Configuration types for rust-procproxy
//!
//! The daemon is configured from a single JSON document: global paths, the
//! fake-IP DNS shim, logging, and one entry per proxy scope (app/global).

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// cgroup v2 mount point
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,

    /// Packet-filter tool invoked for every rule mutation
    #[serde(default = "default_iptables_bin")]
    pub iptables_bin: String,

    /// Address the TPROXY listeners bind to (also used as `--on-ip`)
    #[serde(default = "default_listen_ip")]
    pub listen_ip: Ipv4Addr,

    /// Upstream dial timeout in seconds
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// Deadline for the whole proxy handshake after the dial, in seconds
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Fake-IP DNS responder
    #[serde(default)]
    pub fake_dns: FakeDnsSection,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Proxy scopes
    #[serde(default)]
    pub scopes: Vec<ScopeConfig>,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iptables_bin.is_empty() {
            return Err(ConfigError::ValidationError(
                "iptables_bin cannot be empty".into(),
            ));
        }

        if self.dial_timeout_secs == 0 || self.handshake_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "dial_timeout_secs and handshake_timeout_secs must be greater than 0".into(),
            ));
        }

        self.fake_dns.validate()?;

        let mut kinds = HashSet::new();
        let mut ports = HashSet::new();
        let mut marks = HashSet::new();
        for scope in &self.scopes {
            scope.validate()?;
            if !kinds.insert(scope.scope) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate scope: {}",
                    scope.scope
                )));
            }
            if !ports.insert(scope.listen_port) {
                return Err(ConfigError::ValidationError(format!(
                    "listen_port {} used by more than one scope",
                    scope.listen_port
                )));
            }
            if !marks.insert(scope.mark) {
                return Err(ConfigError::ValidationError(format!(
                    "mark {} used by more than one scope",
                    scope.mark
                )));
            }
        }

        Ok(())
    }

    /// Scopes that are switched on
    pub fn enabled_scopes(&self) -> impl Iterator<Item = &ScopeConfig> {
        self.scopes.iter().filter(|s| s.enabled)
    }

    /// Get dial timeout as Duration
    #[must_use]
    pub const fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Get handshake timeout as Duration
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        let mut proxies = BTreeMap::new();
        proxies.insert(
            ProxyType::Sock5,
            vec![ProxyServer::new("local", "127.0.0.1", 1080)],
        );

        Self {
            cgroup_root: default_cgroup_root(),
            iptables_bin: default_iptables_bin(),
            listen_ip: default_listen_ip(),
            dial_timeout_secs: default_dial_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            fake_dns: FakeDnsSection::default(),
            log: LogConfig::default(),
            scopes: vec![ScopeConfig {
                scope: ScopeKind::Global,
                enabled: false,
                listen_port: 8080,
                mark: 8080,
                proxy_type: ProxyType::Sock5,
                proxy_name: "local".into(),
                proxies,
                proxy_programs: Vec::new(),
                no_proxy_programs: Vec::new(),
                whitelist: default_whitelist(),
                udp_enabled: true,
            }],
        }
    }
}

/// Proxy scope kind
///
/// App-level policy is evaluated before the global one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    /// Only the listed programs are proxied
    App,
    /// Everything except the bypass list is proxied
    Global,
}

impl ScopeKind {
    /// Name used for the scope's chain and cgroup slice
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::App => "App",
            Self::Global => "Global",
        }
    }

    /// Default classification priority of the scope's controller
    #[must_use]
    pub const fn default_priority(self) -> u32 {
        match self {
            Self::App => 2,
            Self::Global => 3,
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::App => write!(f, "app"),
            Self::Global => write!(f, "global"),
        }
    }
}

/// Upstream proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    /// HTTP CONNECT
    Http,
    /// SOCKS4
    Sock4,
    /// SOCKS5 (TCP CONNECT and UDP ASSOCIATE)
    Sock5,
}

impl ProxyType {
    /// Whether UDP can be relayed through this proxy type
    #[must_use]
    pub const fn supports_udp(self) -> bool {
        matches!(self, Self::Sock5)
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Sock4 => write!(f, "sock4"),
            Self::Sock5 => write!(f, "sock5"),
        }
    }
}

/// One named upstream proxy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProxyServer {
    /// Name referenced by `ScopeConfig::proxy_name`
    pub name: String,
    /// Hostname or IP of the proxy
    pub server: String,
    /// Proxy port
    pub port: u16,
    /// Optional username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Optional password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxyServer {
    /// Create an unauthenticated proxy entry
    pub fn new(name: impl Into<String>, server: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            server: server.into(),
            port,
            user: None,
            password: None,
        }
    }

    /// Attach credentials
    #[must_use]
    pub fn with_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// `host:port` string used for dialing
    #[must_use]
    pub fn address(&self) -> String {
        if self.server.contains(':') && !self.server.starts_with('[') {
            format!("[{}]:{}", self.server, self.port)
        } else {
            format!("{}:{}", self.server, self.port)
        }
    }

    /// Credentials, only when a non-empty username is set
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match self.user.as_deref() {
            Some(user) if !user.is_empty() => {
                Some((user, self.password.as_deref().unwrap_or_default()))
            }
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() || self.server.is_empty() {
            return Err(ConfigError::ValidationError(
                "Proxy name and server cannot be empty".into(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Proxy {} has port 0",
                self.name
            )));
        }
        if let Some((user, password)) = self.credentials() {
            if user.len() > 255 || password.len() > 255 {
                return Err(ConfigError::ValidationError(format!(
                    "Proxy {} credentials exceed 255 bytes",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Per-scope configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScopeConfig {
    /// Which scope this entry configures
    pub scope: ScopeKind,

    /// Start this scope at daemon start
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Local TPROXY port for this scope
    pub listen_port: u16,

    /// Firewall mark set on this scope's traffic
    pub mark: u32,

    /// Protocol of the selected upstream
    pub proxy_type: ProxyType,

    /// Name of the selected upstream in `proxies[proxy_type]`
    pub proxy_name: String,

    /// Named upstreams, grouped by protocol
    #[serde(default)]
    pub proxies: BTreeMap<ProxyType, Vec<ProxyServer>>,

    /// Executables whose traffic this scope proxies
    #[serde(default)]
    pub proxy_programs: Vec<String>,

    /// Executables that always bypass the proxy
    #[serde(default)]
    pub no_proxy_programs: Vec<String>,

    /// Destination networks that are never redirected
    #[serde(default = "default_whitelist")]
    pub whitelist: Vec<Ipv4Net>,

    /// Redirect UDP as well (SOCKS5 only)
    #[serde(default = "default_true")]
    pub udp_enabled: bool,
}

impl ScopeConfig {
    /// Scope tunnelling through `server`, with default lists
    #[must_use]
    pub fn new(
        scope: ScopeKind,
        listen_port: u16,
        mark: u32,
        proxy_type: ProxyType,
        server: ProxyServer,
    ) -> Self {
        let proxy_name = server.name.clone();
        let mut proxies = BTreeMap::new();
        proxies.insert(proxy_type, vec![server]);
        Self {
            scope,
            enabled: true,
            listen_port,
            mark,
            proxy_type,
            proxy_name,
            proxies,
            proxy_programs: Vec::new(),
            no_proxy_programs: Vec::new(),
            whitelist: default_whitelist(),
            udp_enabled: true,
        }
    }

    /// Validate scope configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_port == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Scope {} listen_port must be greater than 0",
                self.scope
            )));
        }
        if self.mark == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Scope {} mark must be greater than 0",
                self.scope
            )));
        }

        for server in self.proxies.values().flatten() {
            server.validate()?;
        }

        if self.selected_proxy().is_none() {
            return Err(ConfigError::ValidationError(format!(
                "Scope {}: proxy '{}' not found among {} proxies",
                self.scope, self.proxy_name, self.proxy_type
            )));
        }

        for path in self.proxy_programs.iter().chain(&self.no_proxy_programs) {
            if !path.starts_with('/') {
                return Err(ConfigError::ValidationError(format!(
                    "Program path '{path}' must be absolute"
                )));
            }
        }

        Ok(())
    }

    /// The upstream this scope tunnels through
    #[must_use]
    pub fn selected_proxy(&self) -> Option<&ProxyServer> {
        self.proxies
            .get(&self.proxy_type)?
            .iter()
            .find(|p| p.name == self.proxy_name)
    }

    /// Whether UDP is redirected for this scope
    #[must_use]
    pub fn redirects_udp(&self) -> bool {
        self.udp_enabled && self.proxy_type.supports_udp()
    }
}

/// Fake-IP DNS responder settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FakeDnsSection {
    /// Run the responder
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Loopback address the responder binds to
    #[serde(default = "default_fake_dns_listen")]
    pub listen: SocketAddr,

    /// Block fake addresses are allocated from
    #[serde(default = "default_fake_dns_pool")]
    pub ipv4_pool: Ipv4Net,

    /// Forward cache capacity
    #[serde(default = "default_fake_dns_max_entries")]
    pub max_entries: u64,
}

impl FakeDnsSection {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::ValidationError(
                "fake_dns.max_entries must be greater than 0".into(),
            ));
        }
        if self.ipv4_pool.prefix_len() > 30 {
            return Err(ConfigError::ValidationError(format!(
                "fake_dns.ipv4_pool {} is too small",
                self.ipv4_pool
            )));
        }
        Ok(())
    }
}

impl Default for FakeDnsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_fake_dns_listen(),
            ipv4_pool: default_fake_dns_pool(),
            max_entries: default_fake_dns_max_entries(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default)]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: false,
        }
    }
}

// Default value functions

const fn default_true() -> bool {
    true
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_iptables_bin() -> String {
    "iptables".into()
}

const fn default_listen_ip() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

const fn default_dial_timeout_secs() -> u64 {
    3
}

const fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_fake_dns_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 1053))
}

fn default_fake_dns_pool() -> Ipv4Net {
    "198.18.0.0/15".parse().expect("valid IPv4 CIDR")
}

const fn default_fake_dns_max_entries() -> u64 {
    65536
}

fn default_whitelist() -> Vec<Ipv4Net> {
    vec!["127.0.0.0/8".parse().expect("valid IPv4 CIDR")]
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
