//! Classification integration tests
//!
//! Controllers live under a temp dir standing in for the cgroup v2 mount.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rust_procproxy::cgroup::{ControllerManager, Priority, ProcEvent, ProcRecord, PROCS_FILE};

const FOO: &str = "/usr/bin/foo";

fn manager() -> (ControllerManager, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let manager = ControllerManager::new(dir.path());
    manager.create_priority_controller("main", Priority::MAIN).unwrap();
    manager.create_priority_controller("app", Priority(2)).unwrap();
    manager.create_priority_controller("global", Priority(3)).unwrap();
    (manager, dir)
}

fn procs(root: &Path, slice: &str) -> String {
    std::fs::read_to_string(root.join(slice).join(PROCS_FILE)).unwrap_or_default()
}

#[test]
fn test_higher_priority_keeps_path() {
    let (manager, dir) = manager();
    let running = [ProcRecord::new(FOO, 42, Some("/user.slice".into()))];
    manager.claim_path("app", FOO, &running).unwrap();

    manager.add_controlled_path("global", FOO).unwrap();
    assert_eq!(manager.update_from_manager("global", FOO).unwrap(), 0);
    assert_eq!(manager.move_in("global", FOO, &running).unwrap(), 0);

    assert_eq!(manager.tracking_controllers(FOO), vec!["app"]);
    assert_eq!(manager.controller_by_path(FOO).as_deref(), Some("app"));
    assert_eq!(procs(dir.path(), "app.slice"), "42\n");
    assert_eq!(procs(dir.path(), "global.slice"), "");
}

#[test]
fn test_path_tracked_by_one_controller_at_most() {
    let (manager, _dir) = manager();
    let running: Vec<ProcRecord> = (100..104).map(|pid| ProcRecord::new(FOO, pid, None)).collect();

    let steps: [(&str, &str); 6] = [
        ("claim", "global"),
        ("claim", "app"),
        ("update", "global"),
        ("move", "global"),
        ("release", "app"),
        ("claim", "main"),
    ];
    for (op, name) in steps {
        let result = match op {
            "claim" => manager.claim_path(name, FOO, &running),
            "update" => manager.update_from_manager(name, FOO),
            "move" => manager.move_in(name, FOO, &running),
            _ => manager.del_controlled_path(name, FOO),
        };
        result.unwrap();
        assert!(
            manager.tracking_controllers(FOO).len() <= 1,
            "after {op} {name}: {:?}",
            manager.tracking_controllers(FOO)
        );
    }
    assert_eq!(manager.tracking_controllers(FOO), vec!["main"]);
}

#[test]
fn test_dropping_app_hands_processes_to_global() {
    let (manager, dir) = manager();
    let running = [ProcRecord::new(FOO, 9, None)];
    manager.claim_path("global", FOO, &running).unwrap();
    manager.claim_path("app", FOO, &running).unwrap();
    assert_eq!(manager.tracking_controllers(FOO), vec!["app"]);

    assert_eq!(manager.del_controlled_path("app", FOO).unwrap(), 1);
    assert_eq!(manager.tracking_controllers(FOO), vec!["global"]);
    assert!(procs(dir.path(), "global.slice").ends_with("9\n"));
}

#[test]
fn test_remove_controller_returns_processes_home() {
    let (manager, dir) = manager();
    std::fs::create_dir_all(dir.path().join("user.slice")).unwrap();
    let running = [
        ProcRecord::new(FOO, 5, Some("/user.slice".into())),
        ProcRecord::new(FOO, 6, None),
    ];
    manager.claim_path("app", FOO, &running).unwrap();

    assert_eq!(manager.remove_controller("app").unwrap(), 2);
    assert!(manager.controller("app").is_none());
    assert_eq!(procs(dir.path(), "user.slice"), "5\n");
    assert_eq!(std::fs::read_to_string(dir.path().join(PROCS_FILE)).unwrap(), "6\n");
}

#[tokio::test]
async fn test_process_events_follow_ownership() {
    let (manager, dir) = manager();
    let manager = Arc::new(manager);
    manager.add_controlled_path("app", FOO).unwrap();

    let (tx, rx) = mpsc::channel(8);
    let task = tokio::spawn(Arc::clone(&manager).run_event_loop(rx, CancellationToken::new()));

    tx.send(ProcEvent::Exec(ProcRecord::new(FOO, 77, None))).await.unwrap();
    tx.send(ProcEvent::Exec(ProcRecord::new("/usr/bin/other", 78, None)))
        .await
        .unwrap();
    tx.send(ProcEvent::Exec(ProcRecord::new(FOO, 79, None))).await.unwrap();
    tx.send(ProcEvent::Exit {
        exec_path: FOO.to_string(),
        pid: 77,
    })
    .await
    .unwrap();
    // exiting twice is harmless
    tx.send(ProcEvent::Exit {
        exec_path: FOO.to_string(),
        pid: 77,
    })
    .await
    .unwrap();
    drop(tx);
    task.await.unwrap();

    let app = manager.controller("app").unwrap();
    let pids: Vec<u32> = app.tracked(FOO).iter().map(|r| r.pid).collect();
    assert_eq!(pids, vec![79]);
    assert_eq!(procs(dir.path(), "app.slice"), "77\n79\n");
    assert!(manager.tracking_controllers("/usr/bin/other").is_empty());
}
