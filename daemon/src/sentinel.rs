//! Sentinel files: the contract between the service and the sandbox run-script.
//!
//! The container never talks to the service directly. It writes into the
//! mounted workspace:
//!
//! - `version`: toolchain version banner, written before the program runs
//! - `stdout`, `stderr`: program output, appended while it runs
//! - `status`: written last; the exit code, or `timeout` when the wall-clock
//!   limit killed the container
//! - `completed`: marker written by older run-scripts instead of `status`
//!
//! Any read that fails (not written yet, workspace already deleted) is
//! reported as absent.

use std::path::{Path, PathBuf};

use tracing::trace;

pub const VERSION_FILE: &str = "version";
pub const STDOUT_FILE: &str = "stdout";
pub const STDERR_FILE: &str = "stderr";
pub const STATUS_FILE: &str = "status";
pub const COMPLETED_FILE: &str = "completed";

/// `status` content written when the container hit its time limit.
pub const TIMEOUT_STATUS: &str = "timeout";

/// Version reported when the container never wrote one.
pub const UNKNOWN_VERSION: &str = "N/A";

/// How a job ended, according to its terminal sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalMarker {
    /// The program ran to completion (any exit code).
    Finished,
    /// The container's own timeout fired.
    TimedOut,
}

/// Read-only view over one workspace's sentinel files.
#[derive(Debug, Clone)]
pub struct Sentinels {
    dir: PathBuf,
}

impl Sentinels {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Toolchain version, if written yet.
    pub async fn version(&self) -> Option<String> {
        self.read(VERSION_FILE).await
    }

    /// Captured stdout so far (empty when absent).
    pub async fn stdout(&self) -> String {
        self.read(STDOUT_FILE).await.unwrap_or_default()
    }

    /// Captured stderr so far (empty when absent).
    pub async fn stderr(&self) -> String {
        self.read(STDERR_FILE).await.unwrap_or_default()
    }

    /// The terminal marker, once the job has ended.
    ///
    /// `status` counts once it has any content, so a run-script that has created
    /// but not yet filled it is still running. `completed` counts on sight.
    pub async fn terminal_marker(&self) -> Option<TerminalMarker> {
        if let Some(status) = self.read(STATUS_FILE).await {
            if status.trim() == TIMEOUT_STATUS {
                return Some(TerminalMarker::TimedOut);
            }
            if !status.is_empty() {
                return Some(TerminalMarker::Finished);
            }
        }

        self.read(COMPLETED_FILE)
            .await
            .map(|_| TerminalMarker::Finished)
    }

    async fn read(&self, name: &str) -> Option<String> {
        let path = self.dir.join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => {
                trace!(path = %path.display(), error = %e, "Sentinel not readable");
                None
            }
        }
    }
}
