//! Rule tree integration tests
//!
//! Drive the mangle table through `FilterSession` and the scope rule layout
//! and check both the in-memory tree and the exact commands issued.

use std::net::Ipv4Addr;
use std::sync::Arc;

use rust_procproxy::config::{ProxyServer, ProxyType, ScopeConfig, ScopeKind};
use rust_procproxy::error::FilterError;
use rust_procproxy::iptables::{
    Action, CompleteRule, FilterSession, RecordingExecutor, Table, ENTRY_CHAIN, MAIN_CHAIN,
};
use rust_procproxy::scope::rules;

const LISTEN_IP: Ipv4Addr = Ipv4Addr::LOCALHOST;

fn scope(kind: ScopeKind, port: u16) -> ScopeConfig {
    ScopeConfig::new(
        kind,
        port,
        u32::from(port),
        ProxyType::Sock5,
        ProxyServer::new("p", "127.0.0.1", 1080),
    )
}

fn mark(mark: u32) -> CompleteRule {
    CompleteRule::new(Action::Mark { mark }).base("p", "tcp")
}

#[test]
fn test_same_rule_installed_once() {
    let exec = Arc::new(RecordingExecutor::new());
    let mut table = Table::new("mangle", exec.clone());

    assert!(table.append_rule("PREROUTING", mark(1)).unwrap());
    assert!(!table.append_rule("PREROUTING", mark(1)).unwrap());
    assert!(!table.insert_rule("PREROUTING", 0, mark(1)).unwrap());

    assert_eq!(table.rules_count("PREROUTING"), 1);
    assert_eq!(exec.history(), vec!["-t mangle -A PREROUTING -j MARK --set-mark 1 -p tcp"]);
}

#[test]
fn test_children_removed_before_parent() {
    let exec = Arc::new(RecordingExecutor::new());
    let mut table = Table::new("mangle", exec.clone());
    table.create_child(ENTRY_CHAIN, 0, CompleteRule::jump(MAIN_CHAIN)).unwrap();
    table.create_child(MAIN_CHAIN, 0, CompleteRule::jump("App")).unwrap();
    table.create_child(MAIN_CHAIN, 1, CompleteRule::jump("Global")).unwrap();
    table.create_child("App", 0, CompleteRule::jump("Nested")).unwrap();
    table.append_rule("Nested", mark(7)).unwrap();
    exec.clear();

    table.remove_chain(MAIN_CHAIN).unwrap();

    let pos = |p: &str| exec.position(p).unwrap();
    assert_eq!(pos("-D OUTPUT -j Main"), 0);
    assert!(pos("-X Nested") < pos("-X App"));
    assert!(pos("-X App") < pos("-X Main"));
    assert!(pos("-X Global") < pos("-X Main"));
    assert!(pos("-F Main") < pos("-X Main"));
    for chain in [MAIN_CHAIN, "App", "Global", "Nested"] {
        assert!(!table.contains(chain));
    }
    assert_eq!(table.children_count(ENTRY_CHAIN), 0);
}

#[test]
fn test_failed_command_leaves_tree_unchanged() {
    let exec = Arc::new(RecordingExecutor::new());
    let mut table = Table::new("mangle", exec.clone());
    exec.fail_on("-A PREROUTING");

    let err = table.append_rule("PREROUTING", mark(1)).unwrap_err();
    assert!(matches!(err, FilterError::CommandFailed { .. }));
    assert_eq!(table.rules_count("PREROUTING"), 0);

    exec.clear_failures();
    assert!(table.append_rule("PREROUTING", mark(1)).unwrap());
}

#[test]
fn test_index_out_of_range() {
    let exec = Arc::new(RecordingExecutor::new());
    let mut table = Table::new("mangle", exec.clone());
    let err = table.insert_rule("OUTPUT", 3, mark(1)).unwrap_err();
    assert!(matches!(err, FilterError::IndexOutOfRange { index: 3, len: 0, .. }));
    assert!(exec.history().is_empty());
}

#[test]
fn test_shared_main_outlives_first_scope() {
    let exec = Arc::new(RecordingExecutor::new());
    let session = FilterSession::new(exec.clone());
    let app = scope(ScopeKind::App, 8090);
    let global = scope(ScopeKind::Global, 8091);

    rules::install(&session, &global, LISTEN_IP).unwrap();
    rules::install(&session, &app, LISTEN_IP).unwrap();
    assert_eq!(exec.count_matching("-N Main"), 1);

    rules::uninstall(&session, &global, LISTEN_IP).unwrap();
    session.with_table(|t| {
        assert!(t.contains(MAIN_CHAIN));
        assert_eq!(t.find_child_index(MAIN_CHAIN, "App"), Some(0));
    });
    assert_eq!(exec.count_matching("-X Main"), 0);

    rules::uninstall(&session, &app, LISTEN_IP).unwrap();
    assert_eq!(exec.count_matching("-X Main"), 1);
    assert_eq!(session.users(), 0);

    // a fresh start rebuilds the entry chain
    rules::install(&session, &app, LISTEN_IP).unwrap();
    assert_eq!(exec.count_matching("-N Main"), 2);
}

#[test]
fn test_first_clean_is_best_effort() {
    let exec = Arc::new(RecordingExecutor::new());
    let session = FilterSession::new(exec.clone());
    let scopes = [scope(ScopeKind::App, 8090), scope(ScopeKind::Global, 8091)];
    exec.fail_on("-D");

    session.first_clean(
        &rules::leftover_chains(),
        &rules::leftover_rules(&scopes, LISTEN_IP),
    );

    assert_eq!(exec.count_matching("-D PREROUTING -j TPROXY"), 4);
    assert_eq!(exec.count_matching("-X App"), 1);
    assert_eq!(exec.count_matching("-X Global"), 1);
    assert!(exec.position("-X Global") < exec.position("-X Main"));
    session.with_table(|t| assert!(!t.contains(MAIN_CHAIN)));
}
