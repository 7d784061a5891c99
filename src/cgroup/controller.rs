//! One classification group and its bookkeeping

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use super::procs::ProcRecord;

/// Classification priority.
///
/// Smaller values are more authoritative: a controller with `Priority(1)`
/// outranks one with `Priority(2)` and keeps any path both would claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Priority(pub u32);

impl Priority {
    /// Bypass group the daemon itself and no-proxy programs live in
    pub const MAIN: Self = Self(1);

    /// Whether `self` wins over `other`
    #[must_use]
    pub const fn outranks(self, other: Self) -> bool {
        self.0 < other.0
    }
}

impl Ord for Priority {
    /// Most authoritative first
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named cgroup (`<root>/<name>.slice`) with its claimed executables and
/// the processes currently moved into it
#[derive(Debug, Clone)]
pub struct Controller {
    name: String,
    priority: Priority,
    dir: PathBuf,
    controlled: Vec<String>,
    tracked: HashMap<String, Vec<ProcRecord>>,
}

impl Controller {
    pub(crate) fn new(name: &str, priority: Priority, root: &Path) -> Self {
        Self {
            name: name.to_string(),
            priority,
            dir: root.join(slice_name(name)),
            controlled: Vec::new(),
            tracked: HashMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Backing cgroup directory
    #[must_use]
    pub fn cgroup_dir(&self) -> &Path {
        &self.dir
    }

    /// Executables explicitly claimed, in insertion order
    #[must_use]
    pub fn controlled_paths(&self) -> &[String] {
        &self.controlled
    }

    #[must_use]
    pub fn controls(&self, path: &str) -> bool {
        self.controlled.iter().any(|p| p == path)
    }

    /// Whether any process of `path` is currently tracked here
    #[must_use]
    pub fn is_tracking(&self, path: &str) -> bool {
        self.tracked.get(path).is_some_and(|v| !v.is_empty())
    }

    /// Tracked processes of `path`
    #[must_use]
    pub fn tracked(&self, path: &str) -> &[ProcRecord] {
        self.tracked.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Paths with at least one tracked process
    #[must_use]
    pub fn tracked_paths(&self) -> Vec<String> {
        self.tracked
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub(crate) fn add_controlled(&mut self, path: &str) -> bool {
        if self.controls(path) {
            return false;
        }
        self.controlled.push(path.to_string());
        true
    }

    pub(crate) fn remove_controlled(&mut self, path: &str) -> bool {
        let before = self.controlled.len();
        self.controlled.retain(|p| p != path);
        before != self.controlled.len()
    }

    /// Record a process; false if `(exec_path, pid)` is already present
    pub(crate) fn add_record(&mut self, record: ProcRecord) -> bool {
        let list = self.tracked.entry(record.exec_path.clone()).or_default();
        if list.iter().any(|r| r.same_process(&record)) {
            return false;
        }
        list.push(record);
        true
    }

    /// Forget one process; `None` if it was not tracked
    pub(crate) fn remove_record(&mut self, path: &str, pid: u32) -> Option<ProcRecord> {
        let list = self.tracked.get_mut(path)?;
        let pos = list.iter().position(|r| r.pid == pid)?;
        let record = list.remove(pos);
        self.prune(path);
        Some(record)
    }

    /// Take every tracked process of `path`
    pub(crate) fn take_records(&mut self, path: &str) -> Vec<ProcRecord> {
        let taken = self
            .tracked
            .get_mut(path)
            .map(std::mem::take)
            .unwrap_or_default();
        self.prune(path);
        taken
    }

    /// Drop the bookkeeping entry of `path` once it is empty, unless the path
    /// is explicitly controlled here
    fn prune(&mut self, path: &str) {
        if self.tracked.get(path).is_some_and(Vec::is_empty) && !self.controls(path) {
            self.tracked.remove(path);
        }
    }
}

/// `<name>.slice`
#[must_use]
pub fn slice_name(name: &str) -> String {
    format!("{name}.slice")
}
