//! Integration tests for rust-procproxy
//!
//! # Test Organization
//!
//! - `rule_tree`: rule install/teardown through the shared filter session
//! - `classification`: controller priority and process events on a temp cgroup tree
//! - `tunnels`: HTTP, SOCKS4 and SOCKS5 handshakes against mock proxies
//! - `fake_ip`: resolver bookkeeping and the DNS responder over UDP
//! - `interception`: a whole scope relaying TCP and UDP to a mock SOCKS5 proxy
//!
//! # Test Requirements
//!
//! Nothing here needs privileges: filter commands go to a recording
//! executor, cgroups live in a temp dir and listeners use plain sockets.

mod classification;
mod fake_ip;
mod interception;
mod rule_tree;
mod tunnels;
