//! Filter rule layout of one proxy scope
//!
//! ```text
//! mangle/OUTPUT  -j Main                       (shared, index 0)
//! mangle/Main    -j App                        (before Global)
//!                -j Global
//! mangle/App     -j RETURN -d <whitelist>
//!                -j RETURN -m cgroup --path main.slice
//!                -j MARK --set-mark M -p tcp -m cgroup --path app.slice
//! mangle/Global  -j RETURN -d <whitelist>
//!                -j RETURN -m cgroup --path main.slice
//!                -j RETURN -m cgroup --path app.slice
//!                -j MARK --set-mark M -p tcp
//! mangle/PREROUTING
//!                -j TPROXY --on-ip IP --on-port P --tproxy-mark M -p tcp -m mark --mark M
//! ```
//!
//! UDP variants of the MARK and TPROXY rules are added when the scope
//! relays UDP.
//!
//! With fake DNS on, the scope's DNS queries are redirected to the responder:
//!
//! ```text
//! nat/OUTPUT     -j REDIRECT --to-ports D -p udp -m udp --dport 53 -m cgroup --path app.slice
//!                -j REDIRECT --to-ports D -p udp -m udp --dport 53
//!                     -m cgroup ! --path main.slice -m cgroup ! --path app.slice
//! ```

use std::net::Ipv4Addr;

use tracing::{info, warn};

use crate::cgroup::slice_name;
use crate::config::{ScopeConfig, ScopeKind};
use crate::error::FilterError;
use crate::iptables::{Action, CompleteRule, FilterSession, Table, ENTRY_CHAIN, MAIN_CHAIN};

/// Controller the daemon itself and excluded programs live in
pub const MAIN_CONTROLLER: &str = "main";

/// Built-in chain the TPROXY rules go to
pub const PREROUTING: &str = "PREROUTING";

/// Port of the DNS queries sent to the fake responder
pub const DNS_PORT: u16 = 53;

fn protocols(cfg: &ScopeConfig) -> &'static [&'static str] {
    if cfg.redirects_udp() {
        &["tcp", "udp"]
    } else {
        &["tcp"]
    }
}

fn cgroup_return(controller: &str) -> CompleteRule {
    CompleteRule::new(Action::Return).extend("cgroup", "path", slice_name(controller))
}

/// Rules of the scope's own chain, in order
#[must_use]
pub fn scope_chain_rules(cfg: &ScopeConfig) -> Vec<CompleteRule> {
    let mut rules: Vec<CompleteRule> = cfg
        .whitelist
        .iter()
        .map(|net| CompleteRule::new(Action::Return).base("d", net.to_string()))
        .collect();

    rules.push(cgroup_return(MAIN_CONTROLLER));
    if cfg.scope == ScopeKind::Global {
        rules.push(cgroup_return(&ScopeKind::App.to_string()));
    }

    for proto in protocols(cfg) {
        let mark = CompleteRule::new(Action::Mark { mark: cfg.mark }).base("p", *proto);
        rules.push(match cfg.scope {
            ScopeKind::App => mark.extend("cgroup", "path", slice_name(&cfg.scope.to_string())),
            ScopeKind::Global => mark,
        });
    }
    rules
}

/// TPROXY rules steering marked packets to the scope's listener
#[must_use]
pub fn prerouting_rules(cfg: &ScopeConfig, listen_ip: Ipv4Addr) -> Vec<CompleteRule> {
    protocols(cfg)
        .iter()
        .map(|proto| {
            CompleteRule::new(Action::Tproxy {
                on_ip: Some(listen_ip),
                on_port: cfg.listen_port,
                mark: cfg.mark,
            })
            .base("p", *proto)
            .extend("mark", "mark", cfg.mark.to_string())
        })
        .collect()
}

/// nat rule sending the scope's DNS queries to the fake responder on `to_port`.
///
/// App and Global match disjoint cgroups, so their order in `OUTPUT` does
/// not matter.
#[must_use]
pub fn dns_redirect_rule(cfg: &ScopeConfig, to_port: u16) -> CompleteRule {
    let rule = CompleteRule::new(Action::Redirect { to_port })
        .base("p", "udp")
        .extend("udp", "dport", DNS_PORT.to_string());
    match cfg.scope {
        ScopeKind::App => rule.extend("cgroup", "path", slice_name(&cfg.scope.to_string())),
        ScopeKind::Global => rule
            .not_extend("cgroup", "path", slice_name(MAIN_CONTROLLER))
            .not_extend("cgroup", "path", slice_name(&ScopeKind::App.to_string())),
    }
}

/// Redirect the scope's DNS queries to the fake responder on `to_port`
///
/// # Errors
///
/// Returns the failing filter operation.
pub fn install_dns_redirect(
    session: &FilterSession,
    cfg: &ScopeConfig,
    to_port: u16,
) -> Result<(), FilterError> {
    let rule = dns_redirect_rule(cfg, to_port);
    session.with_nat_table(|nat| nat.append_rule(ENTRY_CHAIN, rule))?;
    info!("Redirecting {} DNS to port {}", cfg.scope, to_port);
    Ok(())
}

/// Remove the scope's DNS redirect
///
/// # Errors
///
/// Returns the failing filter operation.
pub fn uninstall_dns_redirect(
    session: &FilterSession,
    cfg: &ScopeConfig,
    to_port: u16,
) -> Result<(), FilterError> {
    let rule = dns_redirect_rule(cfg, to_port);
    session.with_nat_table(|nat| nat.del_rule(ENTRY_CHAIN, &rule))?;
    Ok(())
}

/// Where the scope's jump goes in `Main`: App ahead of Global
fn jump_index(table: &Table, scope: ScopeKind) -> usize {
    let end = table.rules_count(MAIN_CHAIN);
    match scope {
        ScopeKind::App => table
            .find_child_index(MAIN_CHAIN, ScopeKind::Global.name())
            .unwrap_or(end),
        ScopeKind::Global => end,
    }
}

fn install_in(table: &mut Table, cfg: &ScopeConfig, listen_ip: Ipv4Addr) -> Result<(), FilterError> {
    let chain = cfg.scope.name();
    let index = jump_index(table, cfg.scope);
    table.create_child(MAIN_CHAIN, index, CompleteRule::jump(chain))?;
    for rule in scope_chain_rules(cfg) {
        table.append_rule(chain, rule)?;
    }
    for rule in prerouting_rules(cfg, listen_ip) {
        table.append_rule(PREROUTING, rule)?;
    }
    Ok(())
}

fn uninstall_in(table: &mut Table, cfg: &ScopeConfig, listen_ip: Ipv4Addr) -> Result<(), FilterError> {
    for rule in prerouting_rules(cfg, listen_ip) {
        table.del_rule(PREROUTING, &rule)?;
    }
    let chain = cfg.scope.name();
    if table.contains(chain) {
        table.remove_chain(chain)?;
    }
    Ok(())
}

/// Install the scope's chain and TPROXY rules.
///
/// On failure whatever was installed is removed again and the session
/// reference is dropped.
///
/// # Errors
///
/// Returns the first failing filter operation.
pub fn install(
    session: &FilterSession,
    cfg: &ScopeConfig,
    listen_ip: Ipv4Addr,
) -> Result<(), FilterError> {
    session.acquire()?;
    let result = session.with_table(|table| {
        install_in(table, cfg, listen_ip).map_err(|e| {
            if let Err(rollback) = uninstall_in(table, cfg, listen_ip) {
                warn!("Rollback of {} rules incomplete: {}", cfg.scope, rollback);
            }
            e
        })
    });
    if let Err(e) = result {
        if let Err(release) = session.release() {
            warn!("Failed to release filter session: {}", release);
        }
        return Err(e);
    }
    info!(
        "Installed {} rules (mark {}, port {})",
        cfg.scope, cfg.mark, cfg.listen_port
    );
    Ok(())
}

/// Remove the scope's rules and drop its session reference
///
/// # Errors
///
/// Returns the first failing filter operation; the session reference is
/// kept in that case so a retry can finish the teardown.
pub fn uninstall(
    session: &FilterSession,
    cfg: &ScopeConfig,
    listen_ip: Ipv4Addr,
) -> Result<(), FilterError> {
    session.with_table(|table| uninstall_in(table, cfg, listen_ip))?;
    session.release()?;
    info!("Removed {} rules", cfg.scope);
    Ok(())
}

/// Chains a crashed run may have left, as (parent, chain) in removal order
#[must_use]
pub fn leftover_chains() -> Vec<(&'static str, &'static str)> {
    vec![
        (MAIN_CHAIN, ScopeKind::App.name()),
        (MAIN_CHAIN, ScopeKind::Global.name()),
        (ENTRY_CHAIN, MAIN_CHAIN),
    ]
}

/// PREROUTING rules a crashed run may have left for `scopes`
#[must_use]
pub fn leftover_rules<'a>(
    scopes: impl IntoIterator<Item = &'a ScopeConfig>,
    listen_ip: Ipv4Addr,
) -> Vec<(&'static str, CompleteRule)> {
    scopes
        .into_iter()
        .flat_map(|cfg| prerouting_rules(cfg, listen_ip))
        .map(|rule| (PREROUTING, rule))
        .collect()
}

/// nat DNS redirects a crashed run may have left for `scopes`
#[must_use]
pub fn leftover_dns_rules<'a>(
    scopes: impl IntoIterator<Item = &'a ScopeConfig>,
    to_port: u16,
) -> Vec<(&'static str, CompleteRule)> {
    scopes
        .into_iter()
        .map(|cfg| (ENTRY_CHAIN, dns_redirect_rule(cfg, to_port)))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{ProxyServer, ProxyType};
    use crate::iptables::RecordingExecutor;

    fn scope(kind: ScopeKind, port: u16, udp: bool) -> ScopeConfig {
        let mut cfg = ScopeConfig::new(
            kind,
            port,
            u32::from(port),
            ProxyType::Sock5,
            ProxyServer::new("p", "127.0.0.1", 1080),
        );
        cfg.whitelist = vec!["10.0.0.0/8".parse().unwrap()];
        cfg.udp_enabled = udp;
        cfg
    }

    const IP: Ipv4Addr = Ipv4Addr::LOCALHOST;

    #[test]
    fn test_app_chain_rules() {
        let rules: Vec<String> = scope_chain_rules(&scope(ScopeKind::App, 8090, true))
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            rules,
            vec![
                "-j RETURN -d 10.0.0.0/8",
                "-j RETURN -m cgroup --path main.slice",
                "-j MARK --set-mark 8090 -p tcp -m cgroup --path app.slice",
                "-j MARK --set-mark 8090 -p udp -m cgroup --path app.slice",
            ]
        );
    }

    #[test]
    fn test_global_chain_skips_app_and_main() {
        let rules: Vec<String> = scope_chain_rules(&scope(ScopeKind::Global, 8091, false))
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            rules,
            vec![
                "-j RETURN -d 10.0.0.0/8",
                "-j RETURN -m cgroup --path main.slice",
                "-j RETURN -m cgroup --path app.slice",
                "-j MARK --set-mark 8091 -p tcp",
            ]
        );
    }

    #[test]
    fn test_prerouting_rules() {
        let rules = prerouting_rules(&scope(ScopeKind::App, 8090, false), IP);
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules[0].to_string(),
            "-j TPROXY --on-ip 127.0.0.1 --on-port 8090 --tproxy-mark 8090 -p tcp -m mark --mark 8090"
        );
    }

    #[test]
    fn test_app_inserted_before_global() {
        let exec = Arc::new(RecordingExecutor::new());
        let session = FilterSession::new(exec.clone());
        let global = scope(ScopeKind::Global, 8091, false);
        let app = scope(ScopeKind::App, 8090, false);

        install(&session, &global, IP).unwrap();
        install(&session, &app, IP).unwrap();

        assert_eq!(session.users(), 2);
        assert_eq!(exec.count_matching("-I Main 1 -j App"), 1);
        session.with_table(|t| {
            assert_eq!(t.find_child_index(MAIN_CHAIN, "App"), Some(0));
            assert_eq!(t.find_child_index(MAIN_CHAIN, "Global"), Some(1));
            assert_eq!(t.children_count(MAIN_CHAIN), 2);
        });
    }

    #[test]
    fn test_uninstall_last_scope_removes_main() {
        let exec = Arc::new(RecordingExecutor::new());
        let session = FilterSession::new(exec.clone());
        let app = scope(ScopeKind::App, 8090, true);
        let global = scope(ScopeKind::Global, 8091, true);

        install(&session, &app, IP).unwrap();
        install(&session, &global, IP).unwrap();

        uninstall(&session, &app, IP).unwrap();
        session.with_table(|t| {
            assert!(t.contains(MAIN_CHAIN));
            assert!(!t.contains("App"));
            assert_eq!(t.rules_count(PREROUTING), 2);
        });

        uninstall(&session, &global, IP).unwrap();
        session.with_table(|t| {
            assert!(!t.contains(MAIN_CHAIN));
            assert_eq!(t.rules_count(PREROUTING), 0);
            assert_eq!(t.rules_count(ENTRY_CHAIN), 0);
        });
        assert_eq!(session.users(), 0);
    }

    #[test]
    fn test_failed_install_rolls_back() {
        let exec = Arc::new(RecordingExecutor::new());
        let session = FilterSession::new(exec.clone());
        exec.fail_on("TPROXY");

        let err = install(&session, &scope(ScopeKind::App, 8090, false), IP).unwrap_err();
        assert!(matches!(err, FilterError::CommandFailed { .. }));
        assert_eq!(session.users(), 0);
        session.with_table(|t| {
            assert!(!t.contains("App"));
            assert!(!t.contains(MAIN_CHAIN));
        });
    }

    #[test]
    fn test_dns_redirect_rules() {
        assert_eq!(
            dns_redirect_rule(&scope(ScopeKind::App, 8090, true), 1053).to_string(),
            "-j REDIRECT --to-ports 1053 -p udp -m udp --dport 53 -m cgroup --path app.slice"
        );
        assert_eq!(
            dns_redirect_rule(&scope(ScopeKind::Global, 8091, true), 1053).to_string(),
            "-j REDIRECT --to-ports 1053 -p udp -m udp --dport 53 \
             -m cgroup ! --path main.slice -m cgroup ! --path app.slice"
        );
    }

    #[test]
    fn test_dns_redirect_install_and_remove() {
        let exec = Arc::new(RecordingExecutor::new());
        let session = FilterSession::new(exec.clone());
        let app = scope(ScopeKind::App, 8090, true);

        install_dns_redirect(&session, &app, 1053).unwrap();
        install_dns_redirect(&session, &app, 1053).unwrap();
        assert_eq!(exec.count_matching("-t nat -A OUTPUT -j REDIRECT"), 1);
        assert_eq!(session.with_nat_table(|t| t.rules_count(ENTRY_CHAIN)), 1);
        assert_eq!(session.with_table(|t| t.rules_count(ENTRY_CHAIN)), 0);

        uninstall_dns_redirect(&session, &app, 1053).unwrap();
        assert_eq!(exec.count_matching("-t nat -D OUTPUT -j REDIRECT"), 1);
        assert_eq!(session.with_nat_table(|t| t.rules_count(ENTRY_CHAIN)), 0);
    }

    #[test]
    fn test_leftovers() {
        let app = scope(ScopeKind::App, 8090, true);
        assert_eq!(leftover_chains().last(), Some(&(ENTRY_CHAIN, MAIN_CHAIN)));
        let rules = leftover_rules([&app], IP);
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|(chain, _)| *chain == PREROUTING));
    }
}
