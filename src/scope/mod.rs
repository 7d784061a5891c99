//! Proxy scopes
//!
//! A scope ties one upstream proxy to a set of programs. Starting it creates
//! its classification controller, installs its chain under `Main` plus the
//! TPROXY rules, and runs the TCP accept loop and UDP receive loop that hand
//! intercepted flows to tunnel handlers.

mod interceptor;
mod proxy_scope;
pub mod rules;

pub use crate::config::ScopeKind;
pub use interceptor::Interceptor;
pub use proxy_scope::{ProxyScope, ScopeContext};
pub use rules::MAIN_CONTROLLER;
