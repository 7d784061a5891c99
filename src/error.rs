//! Error types for rust-procproxy
//!
//! Errors are grouped by subsystem. Every enum carries an `is_recoverable()`
//! hint so long-running loops can decide whether to keep serving after a
//! failure (nothing in the daemon is process-fatal once it has started).

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for rust-procproxy
#[derive(Debug, Error)]
pub enum ProcProxyError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Packet-filter (iptables) errors
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    /// cgroup classification errors
    #[error("Cgroup error: {0}")]
    Cgroup(#[from] CgroupError),

    /// TPROXY TCP socket and listener errors
    #[error("TPROXY error: {0}")]
    Tproxy(#[from] TproxyError),

    /// TPROXY UDP errors
    #[error("UDP error: {0}")]
    Udp(#[from] UdpError),

    /// Upstream tunnel errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Fake-IP DNS responder errors
    #[error("FakeDNS error: {0}")]
    FakeDns(#[from] FakeDnsError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProcProxyError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Filter(e) => e.is_recoverable(),
            Self::Cgroup(e) => e.is_recoverable(),
            Self::Tproxy(e) => e.is_recoverable(),
            Self::Udp(e) => e.is_recoverable(),
            Self::Tunnel(e) => e.is_recoverable(),
            Self::FakeDns(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Packet-filter rule tree errors
///
/// A failing filter command leaves the in-memory record of that step untouched.
#[derive(Debug, Error)]
pub enum FilterError {
    /// The filter tool exited non-zero
    #[error("Filter command `{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// The filter tool could not be spawned at all
    #[error("Failed to run filter tool {bin}: {reason}")]
    Spawn { bin: String, reason: String },

    /// Insert position beyond the end of the chain
    #[error("Index {index} out of range for chain {chain} ({len} rules)")]
    IndexOutOfRange {
        chain: String,
        index: usize,
        len: usize,
    },

    /// Chain name not present in the table
    #[error("Chain {chain} not found in table {table}")]
    ChainNotFound { table: String, chain: String },

    /// Chain name already present in the table
    #[error("Chain {chain} already exists in table {table}")]
    ChainExists { table: String, chain: String },

    /// Built-in chains cannot be created or removed
    #[error("Chain {0} is built in")]
    BuiltinChain(String),

    /// The attaching rule does not jump to the chain being created
    #[error("Rule `{0}` does not jump to a chain")]
    NotAJump(String),
}

impl FilterError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::CommandFailed { .. } => true,
            Self::Spawn { .. } => false,
            Self::IndexOutOfRange { .. } => false,
            Self::ChainNotFound { .. } => false,
            Self::ChainExists { .. } => false,
            Self::BuiltinChain(_) => false,
            Self::NotAJump(_) => false,
        }
    }

    /// Create a command failure error
    pub fn command_failed(
        command: impl Into<String>,
        status: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            status: status.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a chain-not-found error
    pub fn chain_not_found(table: impl Into<String>, chain: impl Into<String>) -> Self {
        Self::ChainNotFound {
            table: table.into(),
            chain: chain.into(),
        }
    }
}

/// cgroup classification errors
#[derive(Debug, Error)]
pub enum CgroupError {
    /// A controller with this name already exists
    #[error("Controller {0} already exists")]
    NameTaken(String),

    /// A controller with this priority already exists
    #[error("Priority {priority} already claimed by controller {owner}")]
    PriorityTaken { priority: u32, owner: String },

    /// No controller with this name
    #[error("Controller {0} not found")]
    NotFound(String),

    /// Failed to create the backing cgroup directory
    #[error("Failed to create cgroup {path}: {reason}")]
    CreateDir { path: PathBuf, reason: String },

    /// Writing a pid to cgroup.procs failed
    #[error("Failed to attach pid {pid} to {path}: {reason}")]
    Attach {
        pid: u32,
        path: PathBuf,
        reason: String,
    },

    /// Scanning /proc failed
    #[error("Process scan failed: {0}")]
    Scan(String),
}

impl CgroupError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::NameTaken(_) | Self::PriorityTaken { .. } | Self::NotFound(_) => false,
            Self::CreateDir { .. } => false,
            Self::Attach { .. } => true,
            Self::Scan(_) => true,
        }
    }

    /// Create an attach error
    pub fn attach(pid: u32, path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Attach {
            pid,
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// TPROXY-related errors
#[derive(Debug, Error)]
pub enum TproxyError {
    /// Failed to create socket
    #[error("Failed to create TPROXY socket: {0}")]
    SocketCreation(String),

    /// Failed to set socket option (IP_TRANSPARENT, etc.)
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Failed to bind to address
    #[error("Failed to bind to {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    /// Failed to accept connection
    #[error("Accept error: {0}")]
    AcceptError(String),

    /// Failed to retrieve original destination
    #[error("Failed to get original destination: {0}")]
    OriginalDstError(String),

    /// Permission denied (CAP_NET_ADMIN required)
    #[error("Permission denied: TPROXY requires CAP_NET_ADMIN capability")]
    PermissionDenied,

    /// I/O error
    #[error("TPROXY I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TproxyError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SocketCreation(_) => false,
            Self::SocketOption { .. } => false,
            Self::BindError { .. } => false,
            Self::AcceptError(_) => true,
            Self::OriginalDstError(_) => true,
            Self::PermissionDenied => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindError {
            addr,
            reason: reason.into(),
        }
    }
}

/// TPROXY UDP errors
#[derive(Debug, Error)]
pub enum UdpError {
    /// Failed to set socket option
    #[error("Failed to set UDP socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Listener stopped
    #[error("UDP listener not active")]
    NotReady,

    /// recvmsg failed or the original destination was missing
    #[error("UDP receive error: {0}")]
    RecvError(String),

    /// Failed to create the fake-dial reply socket
    #[error("Failed to create reply socket for {addr}: {reason}")]
    ReplySocketError { addr: SocketAddr, reason: String },

    /// Permission denied (CAP_NET_ADMIN required)
    #[error("Permission denied: TPROXY UDP requires CAP_NET_ADMIN capability")]
    PermissionDenied,

    /// I/O error
    #[error("UDP I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl UdpError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SocketOption { .. } => false,
            Self::NotReady => false,
            Self::RecvError(_) => true,
            Self::ReplySocketError { .. } => true,
            Self::PermissionDenied => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Create a reply socket error
    pub fn reply_socket(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::ReplySocketError {
            addr,
            reason: reason.into(),
        }
    }
}

/// Upstream tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Dialing the upstream proxy failed
    #[error("Failed to connect to proxy {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// Dial or handshake exceeded its deadline
    #[error("{stage} with {addr} timed out after {timeout_secs}s")]
    Timeout {
        stage: &'static str,
        addr: String,
        timeout_secs: u64,
    },

    /// HTTP CONNECT answered with a non-200 status
    #[error("HTTP proxy refused CONNECT: {status} {message}")]
    Http { status: u16, message: String },

    /// SOCKS4 reply was not {0x00, 0x5A}
    #[error("SOCKS4 request rejected: reply bytes {version:#04x} {code:#04x}")]
    Socks4Rejected { version: u8, code: u8 },

    /// SOCKS5 request reply with non-zero code
    #[error("SOCKS5 request failed: {message} (code {code:#04x})")]
    Socks5Reply { code: u8, message: &'static str },

    /// SOCKS5 username/password rejected
    #[error("SOCKS5 authentication rejected: reply bytes {version:#04x} {status:#04x}")]
    AuthRejected { version: u8, status: u8 },

    /// Any other unexpected byte sequence from the upstream
    #[error("{proxy} protocol violation: {detail}")]
    Protocol { proxy: &'static str, detail: String },

    /// Target cannot be expressed for this proxy type
    #[error("Unsupported target {0}")]
    UnsupportedTarget(String),

    /// A handler with the same key is already active in this scope
    #[error("Handler already active for {0}")]
    Duplicate(String),

    /// I/O error during handshake or relay
    #[error("Tunnel I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TunnelError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectFailed { .. } | Self::Timeout { .. } => true,
            Self::Http { .. } | Self::Socks4Rejected { .. } | Self::Socks5Reply { .. } => true,
            Self::AuthRejected { .. } => false,
            Self::Protocol { .. } => false,
            Self::UnsupportedTarget(_) => false,
            Self::Duplicate(_) => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a protocol violation error
    pub fn protocol(proxy: &'static str, detail: impl Into<String>) -> Self {
        Self::Protocol {
            proxy,
            detail: detail.into(),
        }
    }

    /// Create a connect failure error
    pub fn connect_failed(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            addr: addr.into(),
            reason: reason.into(),
        }
    }
}

/// Fake-IP DNS responder errors
///
/// Pool exhaustion is not an error: allocation wraps and recycles.
#[derive(Debug, Error)]
pub enum FakeDnsError {
    /// The responder could not bind its listen address
    #[error("Failed to bind FakeDNS responder to {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// I/O error
    #[error("FakeDNS I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl FakeDnsError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Bind { .. } => false,
            Self::IoError(_) => true,
        }
    }
}

/// Type alias for Result with ProcProxyError
pub type Result<T> = std::result::Result<T, ProcProxyError>;
