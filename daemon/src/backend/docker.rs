//! Docker backend.
//!
//! Runs the template's `sandbox.sh`, which wraps `docker run` in a wall-clock
//! `timeout` and mounts the workspace into the container. The in-container
//! `run.sh` compiles/runs `main.swift` and writes the sentinel files.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::{HealthReport, SandboxBackend};
use crate::config::Config;
use crate::request::NormalizedConfiguration;
use crate::workspace::Workspace;

/// Launcher script inside the sandbox template.
const SANDBOX_SCRIPT: &str = "sandbox.sh";
/// Run-script executed inside the container.
const RUN_SCRIPT: &str = "run.sh";
/// Tells `sandbox.sh` which Docker CLI to run.
const DOCKER_ENV: &str = "DOCKER";

/// Hard ceiling on a health probe, on top of its in-container `timeout 10`.
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);
const PROBE_SCRIPT: &str = "echo '()' | timeout 10 swiftc - && swift --version";

/// Backend that starts one Docker container per job via `sandbox.sh`.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker: String,
    mount_point: String,
}

impl DockerBackend {
    pub fn new(docker: impl Into<String>, mount_point: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
            mount_point: mount_point.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.docker.clone(), config.mount_point.clone())
    }

    fn launch_command(&self, config: &NormalizedConfiguration, workspace: &Workspace) -> Command {
        let dir = workspace.path();
        let mut cmd = Command::new("/bin/sh");
        cmd.arg(dir.join(SANDBOX_SCRIPT))
            .arg(format!("{}s", config.timeout))
            .arg("--volume")
            .arg(format!("{}:{}", dir.display(), self.mount_point))
            .arg(&config.image)
            .arg("sh")
            .arg(format!("{}/{RUN_SCRIPT}", self.mount_point))
            .arg(config.command_line())
            .current_dir(dir)
            .env_clear()
            .envs(&config.environment)
            .env(DOCKER_ENV, &self.docker)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    #[instrument(skip(self, config, workspace), fields(
        workspace = %workspace.path().display(),
        image = %config.image,
        timeout = config.timeout,
    ))]
    async fn launch(&self, config: &NormalizedConfiguration, workspace: &Workspace) -> Result<()> {
        let mut child = self
            .launch_command(config, workspace)
            .spawn()
            .with_context(|| format!("Failed to spawn {SANDBOX_SCRIPT}"))?;

        debug!(pid = ?child.id(), "Sandbox launched");

        // Reap in the background; results travel through sentinel files.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(%status, "Sandbox process exited"),
                Err(e) => warn!(error = %e, "Failed to wait for sandbox process"),
            }
        });

        Ok(())
    }

    #[instrument(skip(self))]
    async fn probe(&self, version: &str, image: &str) -> Result<HealthReport> {
        let output = Command::new(&self.docker)
            .args(["run", "--rm", "--pull", "never", image, "sh", "-c", PROBE_SCRIPT])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(PROBE_TIMEOUT, output)
            .await
            .map_err(|_| anyhow::anyhow!("Health probe timed out after {PROBE_TIMEOUT:?}"))?
            .with_context(|| format!("Failed to run {}", self.docker))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let installed_version = stdout
            .lines()
            .find(|line| line.contains("Swift version"))
            .map(|line| line.trim().to_string());

        debug!(success = output.status.success(), ?installed_version, "Health probe finished");

        Ok(HealthReport {
            status: if output.status.success() { "pass" } else { "fail" }.to_string(),
            version: version.to_string(),
            installed_version,
        })
    }
}
