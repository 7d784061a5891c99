//! Priority-ordered controller registry
//!
//! Every operation that may move a process between controllers runs under
//! the registry's write lock, so the "one owner per executable" rule holds
//! across concurrent scope start/stop and process events. Lookups (one per
//! process event) take the read lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::controller::{Controller, Priority};
use super::procs::{attach_pid, origin_dir, ProcEvent, ProcRecord};
use crate::error::CgroupError;

/// Registry of classification controllers, sorted by priority
#[derive(Debug)]
pub struct ControllerManager {
    root: PathBuf,
    controllers: RwLock<Vec<Controller>>,
}

/// Attach and log; a failed write still counts as moved
fn attach_logged(dir: &Path, pid: u32) {
    if let Err(e) = attach_pid(dir, pid) {
        warn!("{}", e);
    }
}

fn index_of(list: &[Controller], name: &str) -> Result<usize, CgroupError> {
    list.iter()
        .position(|c| c.name() == name)
        .ok_or_else(|| CgroupError::NotFound(name.to_string()))
}

/// Pull every process of `path` tracked by controllers `list[idx]` outranks
fn update_inner(list: &mut [Controller], idx: usize, path: &str) -> usize {
    let priority = list[idx].priority();
    let dir = list[idx].cgroup_dir().to_path_buf();
    let mut migrated = 0;

    for j in 0..list.len() {
        if j == idx || !priority.outranks(list[j].priority()) || !list[j].is_tracking(path) {
            continue;
        }
        let records = list[j].take_records(path);
        debug!(
            "Migrating {} process(es) of {} from {} to {}",
            records.len(),
            path,
            list[j].name(),
            list[idx].name()
        );
        for record in records {
            attach_logged(&dir, record.pid);
            if list[idx].add_record(record) {
                migrated += 1;
            }
        }
    }
    migrated
}

fn move_in_inner(list: &mut [Controller], idx: usize, path: &str, records: &[ProcRecord]) -> usize {
    let priority = list[idx].priority();
    if let Some(owner) = list
        .iter()
        .find(|c| c.priority().outranks(priority) && (c.controls(path) || c.is_tracking(path)))
    {
        debug!(
            "{} is owned by {}; not moving into {}",
            path,
            owner.name(),
            list[idx].name()
        );
        return 0;
    }

    let mut moved = update_inner(list, idx, path);
    let dir = list[idx].cgroup_dir().to_path_buf();
    for record in records.iter().filter(|r| r.exec_path == path) {
        if list[idx].tracked(path).iter().any(|r| r.same_process(record)) {
            continue;
        }
        attach_logged(&dir, record.pid);
        list[idx].add_record(record.clone());
        moved += 1;
    }
    moved
}

fn release_inner(root: &Path, controller: &mut Controller, path: &str) -> usize {
    let records = controller.take_records(path);
    for record in &records {
        attach_logged(&origin_dir(root, record.origin_cgroup.as_deref()), record.pid);
    }
    if !records.is_empty() {
        debug!(
            "Released {} process(es) of {} from {}",
            records.len(),
            path,
            controller.name()
        );
    }
    records.len()
}

impl ControllerManager {
    /// Create an empty registry rooted at the cgroup v2 mount point
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            controllers: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create `<root>/<name>.slice` and register it.
    ///
    /// # Errors
    ///
    /// Returns `CgroupError::NameTaken` / `PriorityTaken` if either is in use,
    /// or `CgroupError::CreateDir` if the directory cannot be created.
    pub fn create_priority_controller(
        &self,
        name: &str,
        priority: Priority,
    ) -> Result<(), CgroupError> {
        let mut list = self.controllers.write();
        if list.iter().any(|c| c.name() == name) {
            return Err(CgroupError::NameTaken(name.to_string()));
        }
        if let Some(owner) = list.iter().find(|c| c.priority() == priority) {
            return Err(CgroupError::PriorityTaken {
                priority: priority.0,
                owner: owner.name().to_string(),
            });
        }

        let controller = Controller::new(name, priority, &self.root);
        std::fs::create_dir_all(controller.cgroup_dir()).map_err(|e| CgroupError::CreateDir {
            path: controller.cgroup_dir().to_path_buf(),
            reason: e.to_string(),
        })?;

        info!(
            "Created controller {} (priority {}) at {:?}",
            name,
            priority,
            controller.cgroup_dir()
        );
        list.push(controller);
        list.sort_by_key(Controller::priority);
        Ok(())
    }

    /// Release everything `name` tracks and unregister it.
    ///
    /// Returns the number of processes released.
    ///
    /// # Errors
    ///
    /// Returns `CgroupError::NotFound` if no such controller exists.
    pub fn remove_controller(&self, name: &str) -> Result<usize, CgroupError> {
        let mut list = self.controllers.write();
        let idx = index_of(&list, name)?;
        let mut controller = list.remove(idx);
        drop(list);

        let released = controller
            .tracked_paths()
            .iter()
            .map(|path| release_inner(&self.root, &mut controller, path))
            .sum();

        if let Err(e) = std::fs::remove_dir(controller.cgroup_dir()) {
            debug!("Keeping {:?}: {}", controller.cgroup_dir(), e);
        }
        info!("Removed controller {} ({} released)", name, released);
        Ok(released)
    }

    /// Controller names, most authoritative first
    #[must_use]
    pub fn controller_names(&self) -> Vec<String> {
        self.controllers
            .read()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Snapshot of one controller
    #[must_use]
    pub fn controller(&self, name: &str) -> Option<Controller> {
        self.controllers
            .read()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// First controller, in priority order, that claims `path`
    #[must_use]
    pub fn controller_by_path(&self, path: &str) -> Option<String> {
        self.controllers
            .read()
            .iter()
            .find(|c| c.controls(path))
            .map(|c| c.name().to_string())
    }

    /// Controllers currently tracking processes of `path`
    #[must_use]
    pub fn tracking_controllers(&self, path: &str) -> Vec<String> {
        self.controllers
            .read()
            .iter()
            .filter(|c| c.is_tracking(path))
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Add `path` to the controlled set of `name`; `false` if already there.
    ///
    /// # Errors
    ///
    /// Returns `CgroupError::NotFound` if no such controller exists.
    pub fn add_controlled_path(&self, name: &str, path: &str) -> Result<bool, CgroupError> {
        let mut list = self.controllers.write();
        let idx = index_of(&list, name)?;
        Ok(list[idx].add_controlled(path))
    }

    /// Drop `path` from `name`. Its processes go to the next controller that
    /// claims the path, or back to their origin group.
    ///
    /// Returns the number of processes handed on.
    ///
    /// # Errors
    ///
    /// Returns `CgroupError::NotFound` if no such controller exists.
    pub fn del_controlled_path(&self, name: &str, path: &str) -> Result<usize, CgroupError> {
        let mut list = self.controllers.write();
        let idx = index_of(&list, name)?;
        if !list[idx].remove_controlled(path) {
            return Ok(0);
        }

        let next = list
            .iter()
            .position(|c| c.name() != name && c.controls(path));
        match next {
            Some(k) => {
                let records = list[idx].take_records(path);
                let dir = list[k].cgroup_dir().to_path_buf();
                let count = records.len();
                for record in records {
                    attach_logged(&dir, record.pid);
                    list[k].add_record(record);
                }
                debug!("Handed {} process(es) of {} to {}", count, path, list[k].name());
                Ok(count)
            }
            None => Ok(release_inner(&self.root, &mut list[idx], path)),
        }
    }

    /// Attach running processes of `path` to `name`.
    ///
    /// Processes of `path` held by lower-priority controllers are pulled in
    /// as well. Nothing moves if a higher-priority controller owns `path`.
    /// Returns the number of processes moved.
    ///
    /// # Errors
    ///
    /// Returns `CgroupError::NotFound` if no such controller exists.
    pub fn move_in(
        &self,
        name: &str,
        path: &str,
        records: &[ProcRecord],
    ) -> Result<usize, CgroupError> {
        let mut list = self.controllers.write();
        let idx = index_of(&list, name)?;
        Ok(move_in_inner(&mut list, idx, path, records))
    }

    /// Take over processes of `path` from lower-priority controllers.
    ///
    /// A no-op when the owner outranks `name`. Returns the number migrated.
    ///
    /// # Errors
    ///
    /// Returns `CgroupError::NotFound` if no such controller exists.
    pub fn update_from_manager(&self, name: &str, path: &str) -> Result<usize, CgroupError> {
        let mut list = self.controllers.write();
        let idx = index_of(&list, name)?;
        Ok(update_inner(&mut list, idx, path))
    }

    /// Add `path` to `name` and move its running processes in, atomically.
    ///
    /// # Errors
    ///
    /// Returns `CgroupError::NotFound` if no such controller exists.
    pub fn claim_path(
        &self,
        name: &str,
        path: &str,
        running: &[ProcRecord],
    ) -> Result<usize, CgroupError> {
        let mut list = self.controllers.write();
        let idx = index_of(&list, name)?;
        list[idx].add_controlled(path);
        Ok(move_in_inner(&mut list, idx, path, running))
    }

    /// Return processes of `path` tracked by `name` to their origin group.
    ///
    /// # Errors
    ///
    /// Returns `CgroupError::NotFound` if no such controller exists.
    pub fn release_to_manager(&self, name: &str, path: &str) -> Result<usize, CgroupError> {
        let mut list = self.controllers.write();
        let idx = index_of(&list, name)?;
        Ok(release_inner(&self.root, &mut list[idx], path))
    }

    /// Return every process tracked by `name` to its origin group.
    ///
    /// # Errors
    ///
    /// Returns `CgroupError::NotFound` if no such controller exists.
    pub fn release_all(&self, name: &str) -> Result<usize, CgroupError> {
        let mut list = self.controllers.write();
        let idx = index_of(&list, name)?;
        let paths = list[idx].tracked_paths();
        Ok(paths
            .iter()
            .map(|path| release_inner(&self.root, &mut list[idx], path))
            .sum())
    }

    /// A process started: move it into the controller owning its executable.
    ///
    /// The owner is the highest-priority controller that controls or already
    /// tracks the path. Returns the owner's name, if any.
    pub fn add_ctrl_proc(&self, record: ProcRecord) -> Option<String> {
        let mut list = self.controllers.write();
        let idx = list
            .iter()
            .position(|c| c.controls(&record.exec_path) || c.is_tracking(&record.exec_path))?;
        let path = record.exec_path.clone();
        move_in_inner(&mut list, idx, &path, std::slice::from_ref(&record));
        Some(list[idx].name().to_string())
    }

    /// A process exited: forget it wherever it is tracked.
    pub fn del_ctrl_proc(&self, exec_path: &str, pid: u32) -> bool {
        let mut list = self.controllers.write();
        let mut removed = false;
        for controller in list.iter_mut() {
            removed |= controller.remove_record(exec_path, pid).is_some();
        }
        removed
    }

    /// Apply one process event
    pub fn handle_event(&self, event: ProcEvent) {
        match event {
            ProcEvent::Exec(record) => {
                let pid = record.pid;
                if let Some(owner) = self.add_ctrl_proc(record) {
                    debug!("pid {} classified into {}", pid, owner);
                }
            }
            ProcEvent::Exit { exec_path, pid } => {
                self.del_ctrl_proc(&exec_path, pid);
            }
        }
    }

    /// Consume process events until the channel closes or `cancel` fires
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ProcEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }
        debug!("Process event loop stopped");
    }
}
