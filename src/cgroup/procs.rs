//! Process records, cgroup v2 attachment and the process-event feed
//!
//! Attaching a process means writing its decimal pid into the group's
//! `cgroup.procs` file. Existing processes are discovered through `/proc`
//! with the `procfs` crate; later starts and exits arrive as [`ProcEvent`]s.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::CgroupError;

/// Membership file of a cgroup v2 directory
pub const PROCS_FILE: &str = "cgroup.procs";

/// One running process of a tracked executable
///
/// Identity is `(exec_path, pid)`; the origin group is carried along so the
/// process can be returned where it came from.
#[derive(Debug, Clone)]
pub struct ProcRecord {
    pub exec_path: String,
    pub pid: u32,
    /// cgroup path relative to the root (e.g. `/user.slice/session-2.scope`)
    pub origin_cgroup: Option<String>,
}

impl ProcRecord {
    pub fn new(exec_path: impl Into<String>, pid: u32, origin_cgroup: Option<String>) -> Self {
        Self {
            exec_path: exec_path.into(),
            pid,
            origin_cgroup,
        }
    }

    /// Same executable and pid
    #[must_use]
    pub fn same_process(&self, other: &Self) -> bool {
        self.pid == other.pid && self.exec_path == other.exec_path
    }
}

impl PartialEq for ProcRecord {
    fn eq(&self, other: &Self) -> bool {
        self.same_process(other)
    }
}

impl Eq for ProcRecord {}

impl Hash for ProcRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.exec_path.hash(state);
        self.pid.hash(state);
    }
}

/// Process lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcEvent {
    /// A process started running `record.exec_path`
    Exec(ProcRecord),
    /// A process exited
    Exit { exec_path: String, pid: u32 },
}

/// Write `pid` into `<dir>/cgroup.procs`.
///
/// # Errors
///
/// Returns `CgroupError::Attach` if the file cannot be opened or written
/// (most often because the process already exited).
pub fn attach_pid(dir: &Path, pid: u32) -> Result<(), CgroupError> {
    let path = dir.join(PROCS_FILE);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| CgroupError::attach(pid, &path, e.to_string()))?;
    writeln!(file, "{pid}").map_err(|e| CgroupError::attach(pid, &path, e.to_string()))?;
    trace!("Attached pid {} to {:?}", pid, dir);
    Ok(())
}

/// Directory of a (possibly unknown) origin group under `root`
#[must_use]
pub fn origin_dir(root: &Path, origin: Option<&str>) -> PathBuf {
    match origin.map(|o| o.trim_start_matches('/')) {
        Some(rel) if !rel.is_empty() => root.join(rel),
        _ => root.to_path_buf(),
    }
}

/// Extract the unified-hierarchy path from `/proc/<pid>/cgroup` contents
#[must_use]
pub fn parse_cgroup_v2(contents: &str) -> Option<String> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
}

/// Current cgroup v2 path of `pid`, if readable
#[must_use]
pub fn read_origin(pid: u32) -> Option<String> {
    std::fs::read_to_string(format!("/proc/{pid}/cgroup"))
        .ok()
        .and_then(|c| parse_cgroup_v2(&c))
}

/// Every process whose executable can be resolved.
///
/// Kernel threads and processes we may not inspect are skipped.
///
/// # Errors
///
/// Returns `CgroupError::Scan` if `/proc` cannot be enumerated.
pub fn scan_processes() -> Result<Vec<ProcRecord>, CgroupError> {
    let all = procfs::process::all_processes().map_err(|e| CgroupError::Scan(e.to_string()))?;

    let mut records = Vec::new();
    for process in all.flatten() {
        let Ok(pid) = u32::try_from(process.pid()) else {
            continue;
        };
        let Ok(exe) = process.exe() else {
            continue;
        };
        records.push(ProcRecord::new(
            exe.to_string_lossy(),
            pid,
            read_origin(pid),
        ));
    }
    debug!("Scanned {} processes", records.len());
    Ok(records)
}

/// Running processes of `exec_path` among `records`
#[must_use]
pub fn running_of(records: &[ProcRecord], exec_path: &str) -> Vec<ProcRecord> {
    records
        .iter()
        .filter(|r| r.exec_path == exec_path)
        .cloned()
        .collect()
}

/// Polling process-event source built on `/proc` snapshots.
///
/// Diffs consecutive scans and emits `Exec` for new pids and `Exit` for
/// vanished ones.
#[derive(Debug)]
pub struct ProcessMonitor {
    interval: Duration,
    known: HashMap<u32, String>,
}

impl ProcessMonitor {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            known: HashMap::new(),
        }
    }

    /// Seed the known set without emitting events
    pub fn seed(&mut self, records: &[ProcRecord]) {
        self.known = records
            .iter()
            .map(|r| (r.pid, r.exec_path.clone()))
            .collect();
    }

    /// Events between the previous snapshot and `records`
    pub fn diff(&mut self, records: Vec<ProcRecord>) -> Vec<ProcEvent> {
        let mut events = Vec::new();
        let mut current = HashMap::with_capacity(records.len());

        for record in records {
            current.insert(record.pid, record.exec_path.clone());
            if self.known.get(&record.pid) != Some(&record.exec_path) {
                if let Some(old) = self.known.get(&record.pid) {
                    // pid reused or exec'd a new binary
                    events.push(ProcEvent::Exit {
                        exec_path: old.clone(),
                        pid: record.pid,
                    });
                }
                events.push(ProcEvent::Exec(record));
            }
        }

        for (pid, exec_path) in &self.known {
            if !current.contains_key(pid) {
                events.push(ProcEvent::Exit {
                    exec_path: exec_path.clone(),
                    pid: *pid,
                });
            }
        }

        self.known = current;
        events
    }

    /// Poll `/proc` until `cancel` fires, sending events to `tx`
    pub async fn run(mut self, tx: mpsc::Sender<ProcEvent>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let records = match tokio::task::spawn_blocking(scan_processes).await {
                Ok(Ok(records)) => records,
                Ok(Err(e)) => {
                    warn!("Process scan failed: {}", e);
                    continue;
                }
                Err(e) => {
                    warn!("Process scan task failed: {}", e);
                    continue;
                }
            };

            for event in self.diff(records) {
                if tx.send(event).await.is_err() {
                    debug!("Process event receiver closed");
                    return;
                }
            }
        }
    }
}
