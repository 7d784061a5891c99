//! Filter command executors
//!
//! [`Table`](super::Table) never spawns processes itself; it hands the full
//! argument vector (`-t <table> -<op> <chain> ...`) to a [`FilterExecutor`].
//! Production uses [`IptablesExecutor`]; tests and dry runs use
//! [`RecordingExecutor`].

use std::fmt;
use std::process::Command;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::FilterError;

/// Runs one packet-filter command
pub trait FilterExecutor: Send + Sync + fmt::Debug {
    /// Execute the filter tool with `args`.
    ///
    /// # Errors
    ///
    /// Returns `FilterError::CommandFailed` if the tool exits non-zero and
    /// `FilterError::Spawn` if it cannot be started.
    fn run(&self, args: &[String]) -> Result<(), FilterError>;
}

/// Executes commands with the real `iptables` binary
#[derive(Debug, Clone)]
pub struct IptablesExecutor {
    bin: String,
}

impl IptablesExecutor {
    /// Create an executor for `bin` (e.g. `iptables` or `/usr/sbin/iptables-legacy`)
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Binary this executor runs
    #[must_use]
    pub fn bin(&self) -> &str {
        &self.bin
    }
}

impl Default for IptablesExecutor {
    fn default() -> Self {
        Self::new("iptables")
    }
}

impl FilterExecutor for IptablesExecutor {
    fn run(&self, args: &[String]) -> Result<(), FilterError> {
        let command = format!("{} {}", self.bin, args.join(" "));
        debug!("exec: {}", command);

        let output = Command::new(&self.bin)
            .args(args)
            .output()
            .map_err(|e| FilterError::Spawn {
                bin: self.bin.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!("Filter command failed: {} ({}): {}", command, output.status, stderr);
            return Err(FilterError::command_failed(
                command,
                output.status.to_string(),
                stderr,
            ));
        }

        Ok(())
    }
}

/// In-memory executor that records every command
///
/// Commands whose rendered text contains one of the configured failure
/// patterns fail with `CommandFailed` and are still recorded.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    history: Mutex<Vec<String>>,
    fail_patterns: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later command containing `pattern` fail
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.fail_patterns.lock().push(pattern.into());
    }

    /// Stop injecting failures
    pub fn clear_failures(&self) {
        self.fail_patterns.lock().clear();
    }

    /// Every command seen so far, rendered as a single line
    #[must_use]
    pub fn history(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    /// Number of recorded commands containing `pattern`
    #[must_use]
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.history
            .lock()
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    /// Position of the first recorded command containing `pattern`
    #[must_use]
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.history.lock().iter().position(|c| c.contains(pattern))
    }

    pub fn clear(&self) {
        self.history.lock().clear();
    }
}

impl FilterExecutor for RecordingExecutor {
    fn run(&self, args: &[String]) -> Result<(), FilterError> {
        let command = args.join(" ");
        self.history.lock().push(command.clone());

        if self
            .fail_patterns
            .lock()
            .iter()
            .any(|p| command.contains(p.as_str()))
        {
            return Err(FilterError::command_failed(command, "exit status: 1", "injected"));
        }
        Ok(())
    }
}
