//! Per-job workspace directories.
//!
//! A workspace is `{nonce}_{uuid}` under the configured root. It holds a copy
//! of the sandbox template, the generated `main.swift`, and whatever sentinel
//! files the container writes back. It is registered under its nonce while
//! alive and removed exactly once.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::registry::JobRegistry;

/// Generated entry point, relative to the workspace.
pub const ENTRY_POINT: &str = "main.swift";

/// Lines in front of the user's code in [`ENTRY_POINT`].
pub const PREAMBLE_LINES: u64 = 4;

const PREAMBLE: &str = "import Glibc\n\
                        setbuf(stdout, nil)\n\
                        \n\
                        /* Start user code. Do not edit comment generated here */\n";

const EPILOGUE: &str = "\n/* End user code. Do not edit comment generated here */\n";

/// Contents of the generated entry point for `code`.
pub fn entry_point(code: &str) -> String {
    format!("{PREAMBLE}{code}{EPILOGUE}")
}

/// Allocates and populates workspaces.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    template: PathBuf,
    root: PathBuf,
    registry: Arc<JobRegistry>,
}

impl WorkspaceManager {
    pub fn new(template: impl Into<PathBuf>, root: impl Into<PathBuf>, registry: Arc<JobRegistry>) -> Self {
        Self {
            template: template.into(),
            root: root.into(),
            registry,
        }
    }

    pub const fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a workspace for `nonce` containing the template and `code`.
    ///
    /// On any failure the partial directory and registry entry are removed
    /// before the error is returned.
    #[instrument(skip(self, code), fields(code_len = code.len()))]
    pub async fn create(&self, nonce: &str, code: &str) -> Result<Workspace> {
        let path = self
            .root
            .join(format!("{}_{}", directory_prefix(nonce), Uuid::new_v4()));
        self.registry.register(nonce, &path).await;

        let workspace = Workspace {
            path,
            nonce: nonce.to_string(),
            registry: Arc::clone(&self.registry),
            destroyed: AtomicBool::new(false),
        };

        if let Err(e) = self.populate(workspace.path(), code).await {
            workspace.destroy().await;
            return Err(e);
        }

        debug!(workspace = %workspace.path().display(), "Workspace ready");
        Ok(workspace)
    }

    async fn populate(&self, path: &Path, code: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create workspace root {}", self.root.display()))?;
        tokio::fs::create_dir(path)
            .await
            .with_context(|| format!("Failed to create workspace {}", path.display()))?;

        let template = self.template.clone();
        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || copy_dir_contents(&template, &target))
            .await
            .context("Template copy task failed")??;

        tokio::fs::write(path.join(ENTRY_POINT), entry_point(code))
            .await
            .with_context(|| format!("Failed to write {ENTRY_POINT}"))?;
        Ok(())
    }
}

/// A live workspace. Owned by the job; destroyed once.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    nonce: String,
    registry: Arc<JobRegistry>,
    destroyed: AtomicBool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Evict the registry entry and delete the directory.
    ///
    /// Only the first call does anything. Removal errors are logged, not
    /// returned: there is nobody left to report them to.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.registry.evict(&self.nonce, &self.path).await;

        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => debug!(workspace = %self.path.display(), "Workspace removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(workspace = %self.path.display(), error = %e, "Failed to remove workspace");
            }
        }
    }
}

impl Drop for Workspace {
    /// Cleanup for a workspace whose job never reached [`Workspace::destroy`],
    /// e.g. because the job task panicked or was aborted.
    fn drop(&mut self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        warn!(workspace = %self.path.display(), "Workspace dropped without destroy, cleaning up");

        if self.registry.try_evict(&self.nonce, &self.path).is_none() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let registry = Arc::clone(&self.registry);
                let nonce = std::mem::take(&mut self.nonce);
                let path = self.path.clone();
                handle.spawn(async move {
                    registry.evict(&nonce, &path).await;
                });
            }
        }

        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(workspace = %self.path.display(), "Workspace removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(workspace = %self.path.display(), error = %e, "Failed to remove workspace");
            }
        }
    }
}

/// Nonces come from callers; keep them from shaping the path.
fn directory_prefix(nonce: &str) -> String {
    nonce
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn copy_dir_contents(src: &Path, dst: &Path) -> Result<()> {
    let entries = std::fs::read_dir(src)
        .with_context(|| format!("Failed to read sandbox template {}", src.display()))?;
    for entry in entries {
        let entry = entry.context("Failed to read sandbox template entry")?;
        copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
    }
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let metadata =
        std::fs::metadata(src).with_context(|| format!("Failed to stat {}", src.display()))?;
    if metadata.is_dir() {
        std::fs::create_dir(dst).with_context(|| format!("Failed to create {}", dst.display()))?;
        return copy_dir_contents(src, dst);
    }
    std::fs::copy(src, dst)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
    Ok(())
}
