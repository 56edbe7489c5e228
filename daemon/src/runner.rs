//! Job pipeline: validate, prepare the workspace, launch, wait for the result.
//!
//! Launch and completion are two independent tasks joined only through the
//! workspace's sentinel files. The completion poller runs in its own task,
//! so a caller that goes away before the job ends does not stop cleanup.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info, Instrument};

use crate::backend::{HealthReport, SandboxBackend};
use crate::config::Config;
use crate::observer::{LiveObserver, Subscription};
use crate::poller::{Clock, CompletionPoller, ExecutionResult, TokioClock};
use crate::registry::JobRegistry;
use crate::request::{ExecutionRequest, NormalizedConfiguration, RequestError};
use crate::workspace::WorkspaceManager;

/// Why a job produced no result.
#[derive(Debug, Error)]
pub enum RunError {
    /// The request was rejected; no workspace was created.
    #[error("invalid request: {0}")]
    Invalid(#[from] RequestError),
    /// Workspace preparation or launch failed; everything was rolled back.
    #[error("failed to start job: {0:#}")]
    Setup(anyhow::Error),
    /// The poller task ended without delivering a result.
    #[error("job poller stopped before delivering a result")]
    Interrupted,
}

impl RunError {
    /// Whether the caller is at fault.
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }
}

/// Entry point for running code and observing jobs.
pub struct Runner {
    config: Arc<Config>,
    job: Job,
    observer: LiveObserver,
}

/// Everything a spawned job needs, detached from the caller.
#[derive(Clone)]
struct Job {
    workspaces: WorkspaceManager,
    backend: Arc<dyn SandboxBackend>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    grace: Duration,
}

impl Runner {
    pub fn new(config: Config, backend: impl SandboxBackend + 'static) -> Self {
        Self::with_clock(config, backend, Arc::new(TokioClock))
    }

    /// Like [`Runner::new`] with an explicit clock for the wall-clock guard.
    pub fn with_clock(
        config: Config,
        backend: impl SandboxBackend + 'static,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let workspaces = WorkspaceManager::new(
            config.sandbox_dir.clone(),
            config.workspace_root.clone(),
            Arc::clone(&registry),
        );
        let observer = LiveObserver::new(
            registry,
            config.poll_interval(),
            config.observer_attach_window(),
        );
        let job = Job {
            workspaces,
            backend: Arc::new(backend),
            clock,
            interval: config.poll_interval(),
            grace: config.timeout_grace(),
        };
        Self {
            config: Arc::new(config),
            job,
            observer,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub const fn registry(&self) -> &Arc<JobRegistry> {
        self.job.workspaces.registry()
    }

    /// Run `request` against toolchain `version` and wait for its result.
    ///
    /// Validation happens before anything touches the filesystem. The rest
    /// of the job runs in its own task: if this future is dropped, the job
    /// still runs to a terminal state and cleans up after itself.
    pub async fn run(
        &self,
        version: &str,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, RunError> {
        let config = NormalizedConfiguration::from_request(version, request, &self.config)?;

        let span = tracing::info_span!(
            "job",
            nonce = %config.nonce,
            image = %config.image,
            timeout = config.timeout,
        );

        let (tx, rx) = oneshot::channel();
        let job = self.job.clone();
        tokio::spawn(
            async move {
                let outcome = job.execute(config).await;
                if tx.send(outcome).is_err() {
                    info!("Caller went away before the result was ready");
                }
            }
            .instrument(span),
        );

        rx.await.map_err(|_| RunError::Interrupted)?
    }

    /// Stream snapshots of the job registered under `nonce`.
    pub fn observe(&self, nonce: &str) -> Subscription {
        self.observer.attach(nonce)
    }

    /// Health-check the image for `version`.
    pub async fn probe(&self, version: &str) -> anyhow::Result<HealthReport> {
        let image = self.config.image_for(version);
        self.job.backend.probe(version, &image).await
    }
}

impl Job {
    async fn execute(self, config: NormalizedConfiguration) -> Result<ExecutionResult, RunError> {
        let workspace = self
            .workspaces
            .create(&config.nonce, &config.code)
            .await
            .map_err(|e| {
                error!(error = %format!("{e:#}"), "Failed to prepare workspace");
                RunError::Setup(e)
            })?;

        if let Err(e) = self.backend.launch(&config, &workspace).await {
            error!(error = %format!("{e:#}"), "Failed to launch sandbox");
            workspace.destroy().await;
            return Err(RunError::Setup(e));
        }

        info!(workspace = %workspace.path().display(), "Job started");

        let result = CompletionPoller::new(workspace, config.timeout, self.grace, self.clock)
            .run(self.interval)
            .await;

        info!("Job finished");
        Ok(result)
    }
}
