//! Per-process traffic classification through cgroup v2
//!
//! Each proxy scope owns one controller: a `<name>.slice` directory under the
//! cgroup root. The packet filter matches on that directory, so moving a
//! process into the slice is what routes its sockets through the scope.
//!
//! Controllers are ordered by [`Priority`] (smaller wins). An executable is
//! tracked by at most one controller at a time, and a lower-priority
//! controller never takes a path from a higher-priority one.

mod controller;
mod manager;
mod procs;

pub use controller::{slice_name, Controller, Priority};
pub use manager::ControllerManager;
pub use procs::{
    attach_pid, origin_dir, parse_cgroup_v2, read_origin, running_of, scan_processes,
    ProcEvent, ProcRecord, ProcessMonitor, PROCS_FILE,
};
