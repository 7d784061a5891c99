//! Shared filter state for all proxy scopes
//!
//! One [`FilterSession`] is built at daemon start and handed to every scope.
//! The first scope to [`acquire`](FilterSession::acquire) it creates the
//! `Main` entry chain under `mangle/OUTPUT`; the last one to
//! [`release`](FilterSession::release) it tears `Main` down, provided no
//! scope chain is still attached.
//!
//! The session also owns the `nat` table, which only ever holds flat rules
//! on its built-in chains (the per-scope DNS redirects).

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::executor::FilterExecutor;
use super::rule::CompleteRule;
use super::table::Table;
use crate::error::FilterError;

/// Table all scope rules live in
pub const MANGLE: &str = "mangle";

/// Table the DNS redirects live in
pub const NAT: &str = "nat";

/// Shared entry chain, jumped to from `OUTPUT`
pub const MAIN_CHAIN: &str = "Main";

/// Built-in chain the entry chain hangs off
pub const ENTRY_CHAIN: &str = "OUTPUT";

#[derive(Debug)]
struct SessionState {
    table: Table,
    nat: Table,
    users: usize,
}

/// Reference-counted owner of the mangle rule tree
#[derive(Debug)]
pub struct FilterSession {
    state: Mutex<SessionState>,
}

impl FilterSession {
    /// Create a session over fresh mangle and nat tables
    pub fn new(executor: Arc<dyn FilterExecutor>) -> Self {
        Self {
            state: Mutex::new(SessionState {
                table: Table::new(MANGLE, Arc::clone(&executor)),
                nat: Table::new(NAT, executor),
                users: 0,
            }),
        }
    }

    /// Register one more scope, creating `Main` on first use.
    ///
    /// # Errors
    ///
    /// Returns `FilterError` if `Main` cannot be created; the count is not
    /// incremented in that case.
    pub fn acquire(&self) -> Result<(), FilterError> {
        let mut state = self.state.lock();
        if !state.table.contains(MAIN_CHAIN) {
            state
                .table
                .create_child(ENTRY_CHAIN, 0, CompleteRule::jump(MAIN_CHAIN))?;
        } else if state.table.find_child_index(ENTRY_CHAIN, MAIN_CHAIN).is_none() {
            // left behind by a create whose attach failed
            warn!("{} exists but {} does not jump to it; re-attaching", MAIN_CHAIN, ENTRY_CHAIN);
            state
                .table
                .insert_rule(ENTRY_CHAIN, 0, CompleteRule::jump(MAIN_CHAIN))?;
        }
        state.users += 1;
        debug!("Filter session acquired ({} users)", state.users);
        Ok(())
    }

    /// Drop one scope. On the last release `Main` is removed if it has no
    /// children left.
    ///
    /// Returns `true` if `Main` was torn down.
    ///
    /// # Errors
    ///
    /// Returns `FilterError` if removing `Main` fails.
    pub fn release(&self) -> Result<bool, FilterError> {
        let mut state = self.state.lock();
        state.users = state.users.saturating_sub(1);
        debug!("Filter session released ({} users)", state.users);
        if state.users > 0 || !state.table.contains(MAIN_CHAIN) {
            return Ok(false);
        }

        let removed = state.table.remove_if_unused(MAIN_CHAIN)?;
        if removed {
            info!("Removed shared {} chain", MAIN_CHAIN);
        }
        Ok(removed)
    }

    /// Number of scopes currently holding the session
    #[must_use]
    pub fn users(&self) -> usize {
        self.state.lock().users
    }

    /// Run `f` with exclusive access to the table.
    ///
    /// Multi-step installs go through here so no other scope interleaves.
    pub fn with_table<R>(&self, f: impl FnOnce(&mut Table) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state.table)
    }

    /// Run `f` with exclusive access to the nat table
    pub fn with_nat_table<R>(&self, f: impl FnOnce(&mut Table) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state.nat)
    }

    /// Best-effort removal of nat rules a crashed run left behind
    pub fn first_clean_nat(&self, rules: &[(&str, CompleteRule)]) {
        let state = self.state.lock();
        for (chain, rule) in rules {
            state.nat.purge_leftover_rule(chain, rule);
        }
    }

    /// Best-effort removal of chains and rules a crashed run left behind.
    ///
    /// `chains` are (parent, chain) pairs, removed in the given order.
    pub fn first_clean(&self, chains: &[(&str, &str)], rules: &[(&str, CompleteRule)]) {
        let state = self.state.lock();
        info!("Cleaning leftover filter state");
        for (chain, rule) in rules {
            state.table.purge_leftover_rule(chain, rule);
        }
        for (parent, chain) in chains {
            state.table.purge_leftover_chain(parent, chain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iptables::executor::RecordingExecutor;

    fn session() -> (FilterSession, Arc<RecordingExecutor>) {
        let exec = Arc::new(RecordingExecutor::new());
        (FilterSession::new(exec.clone()), exec)
    }

    #[test]
    fn test_first_acquire_creates_main_once() {
        let (session, exec) = session();
        session.acquire().unwrap();
        session.acquire().unwrap();
        assert_eq!(session.users(), 2);
        assert_eq!(exec.count_matching("-N Main"), 1);
        assert_eq!(exec.count_matching("-I OUTPUT 1 -j Main"), 1);
    }

    #[test]
    fn test_last_release_removes_main() {
        let (session, exec) = session();
        session.acquire().unwrap();
        session.acquire().unwrap();

        assert!(!session.release().unwrap());
        assert_eq!(exec.count_matching("-X Main"), 0);

        assert!(session.release().unwrap());
        assert_eq!(exec.count_matching("-X Main"), 1);
        assert!(!session.with_table(|t| t.contains(MAIN_CHAIN)));
    }

    #[test]
    fn test_release_keeps_main_with_children() {
        let (session, exec) = session();
        session.acquire().unwrap();
        session
            .with_table(|t| t.create_child(MAIN_CHAIN, 0, CompleteRule::jump("App")))
            .unwrap();

        assert!(!session.release().unwrap());
        assert!(session.with_table(|t| t.contains(MAIN_CHAIN)));
        assert_eq!(exec.count_matching("-X"), 0);
    }

    #[test]
    fn test_failed_acquire_does_not_count() {
        let (session, exec) = session();
        exec.fail_on("-N Main");
        assert!(session.acquire().is_err());
        assert_eq!(session.users(), 0);

        exec.clear_failures();
        session.acquire().unwrap();
        assert_eq!(session.users(), 1);
    }

    #[test]
    fn test_acquire_reattaches_detached_main() {
        let (session, exec) = session();
        exec.fail_on("-I OUTPUT");
        assert!(session.acquire().is_err());
        assert_eq!(session.users(), 0);
        assert!(session.with_table(|t| t.contains(MAIN_CHAIN)));

        exec.clear_failures();
        session.acquire().unwrap();
        assert_eq!(session.users(), 1);
        assert_eq!(
            session.with_table(|t| t.find_child_index(ENTRY_CHAIN, MAIN_CHAIN)),
            Some(0)
        );
        assert_eq!(exec.count_matching("-N Main"), 1);
        assert_eq!(exec.count_matching("-I OUTPUT 1 -j Main"), 2);

        // already attached: nothing more to issue
        session.acquire().unwrap();
        assert_eq!(exec.count_matching("-I OUTPUT 1 -j Main"), 2);
    }

    #[test]
    fn test_nat_table_is_separate() {
        let (session, exec) = session();
        let rule = CompleteRule::new(crate::iptables::Action::Redirect { to_port: 1053 })
            .base("p", "udp");
        assert!(session
            .with_nat_table(|t| t.append_rule(ENTRY_CHAIN, rule.clone()))
            .unwrap());
        assert_eq!(session.with_table(|t| t.rules_count(ENTRY_CHAIN)), 0);
        assert_eq!(exec.history(), vec!["-t nat -A OUTPUT -j REDIRECT --to-ports 1053 -p udp"]);

        session.first_clean_nat(&[(ENTRY_CHAIN, rule)]);
        assert_eq!(exec.count_matching("-t nat -D OUTPUT"), 1);
    }

    #[test]
    fn test_first_clean_order() {
        let (session, exec) = session();
        exec.fail_on("-D");
        session.first_clean(
            &[(MAIN_CHAIN, "App"), (ENTRY_CHAIN, MAIN_CHAIN)],
            &[("PREROUTING", CompleteRule::new(crate::iptables::Action::Return))],
        );
        let history = exec.history();
        assert_eq!(history[0], "-t mangle -D PREROUTING -j RETURN");
        assert_eq!(history.last().unwrap(), "-t mangle -X Main");
        assert_eq!(history.len(), 7);
    }
}
