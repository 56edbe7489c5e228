//! Live log observers.
//!
//! An observer finds a running job through the [`JobRegistry`] by nonce and
//! streams snapshots of its output until the job's terminal sentinel shows
//! up. Observers only read: deleting the workspace is the completion
//! poller's job, and dropping a [`Subscription`] just stops this observer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::poller::ExecutionResult;
use crate::postprocess::fix_line_numbers;
use crate::registry::JobRegistry;
use crate::sentinel::Sentinels;

/// Creates [`Subscription`]s for nonces.
#[derive(Debug, Clone)]
pub struct LiveObserver {
    registry: Arc<JobRegistry>,
    interval: Duration,
    attach_window: Duration,
}

impl LiveObserver {
    /// `attach_window` bounds how long a subscription waits for its nonce to
    /// be registered before giving up.
    pub const fn new(registry: Arc<JobRegistry>, interval: Duration, attach_window: Duration) -> Self {
        Self {
            registry,
            interval,
            attach_window,
        }
    }

    /// Start streaming snapshots for `nonce`.
    pub fn attach(&self, nonce: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(observe(
            Arc::clone(&self.registry),
            nonce.to_string(),
            self.interval,
            self.attach_window,
            tx,
        ));
        Subscription { rx, task }
    }
}

/// Stream of snapshots for one job. Ends when the job does.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<ExecutionResult>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Next snapshot, or `None` once the observer has stopped.
    pub async fn next(&mut self) -> Option<ExecutionResult> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn observe(
    registry: Arc<JobRegistry>,
    nonce: String,
    interval: Duration,
    attach_window: Duration,
    tx: mpsc::Sender<ExecutionResult>,
) {
    let attached_at = tokio::time::Instant::now();
    let mut found = false;
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // First tick is immediate, skip it

    loop {
        ticker.tick().await;

        let Some(path) = registry.lookup(&nonce).await else {
            if found {
                debug!(nonce = %nonce, "Job left the registry, stopping observer");
                break;
            }
            if attached_at.elapsed() >= attach_window {
                debug!(nonce = %nonce, "No job registered for nonce, stopping observer");
                break;
            }
            continue;
        };
        found = true;

        let sentinels = Sentinels::new(path);
        let Some(version) = sentinels.version().await else {
            trace!(nonce = %nonce, "Version not written yet");
            continue;
        };
        // Checked before reading output so the last snapshot is complete
        let finished = sentinels.terminal_marker().await.is_some();
        let output = sentinels.stdout().await;
        let errors = sentinels.stderr().await;

        let snapshot = ExecutionResult {
            output,
            errors: fix_line_numbers(&errors),
            version,
        };
        if tx.send(snapshot).await.is_err() {
            break;
        }

        if finished {
            debug!(nonce = %nonce, "Job finished, stopping observer");
            break;
        }
    }
}
