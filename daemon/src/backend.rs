//! Sandbox backend trait and implementations.
//!
//! A backend starts the container for a prepared workspace and returns as
//! soon as it is running. It never reports the program's result: the
//! run-script inside the sandbox writes sentinel files into the workspace,
//! and the pollers pick them up from there.

mod docker;

pub use docker::DockerBackend;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::request::NormalizedConfiguration;
use crate::workspace::Workspace;

/// Outcome of a toolchain image health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `pass` or `fail`.
    pub status: String,
    /// The version that was probed.
    pub version: String,
    /// Toolchain banner reported by the image, when it ran.
    pub installed_version: Option<String>,
}

impl HealthReport {
    pub fn passed(&self) -> bool {
        self.status == "pass"
    }
}

/// Trait for sandbox backends.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Start the sandboxed process for `config` against `workspace`.
    ///
    /// Returns once the process has been spawned; completion is signalled
    /// only through the workspace's sentinel files.
    async fn launch(&self, config: &NormalizedConfiguration, workspace: &Workspace) -> Result<()>;

    /// Run a minimal program against `image` and report whether it works.
    async fn probe(&self, version: &str, image: &str) -> Result<HealthReport>;
}
