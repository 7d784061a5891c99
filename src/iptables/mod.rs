//! Packet-filter rule tree
//!
//! An in-memory mirror of the iptables state the daemon installs, kept in
//! lockstep with the kernel by issuing one filter command per mutation.
//!
//! # Layout
//!
//! ```text
//! mangle/OUTPUT
//!   -j Main
//!        -j App      (inserted before Global)
//!        -j Global
//! mangle/PREROUTING
//!   -j TPROXY --on-port <port> --tproxy-mark <mark> -p tcp -m mark --mark <mark>
//! nat/OUTPUT
//!   -j REDIRECT --to-ports <dns port> -p udp -m udp --dport 53 -m cgroup ...
//! ```
//!
//! Rules are identified structurally: installing an equal rule twice issues
//! the command once, and deleting an absent rule issues nothing.

mod executor;
mod rule;
mod session;
mod table;

pub use executor::{FilterExecutor, IptablesExecutor, RecordingExecutor};
pub use rule::{Action, BaseMatch, CompleteRule, ExtendMatch};
pub use session::{FilterSession, ENTRY_CHAIN, MAIN_CHAIN, MANGLE, NAT};
pub use table::{builtin_chains, Chain, Table};
