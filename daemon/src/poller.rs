//! Completion polling.
//!
//! The sandboxed process is detached from the request, so the only way to
//! learn that it finished is to watch the workspace for a terminal sentinel.
//! [`CompletionPoller`] is a small state machine driven by a timer:
//!
//! ```text
//! Pending --start--> Running --status/completed--> Completed
//!                       |---status == timeout----> TimedOut
//!                       `---wall clock > limit---> TimedOut
//! ```
//!
//! The first terminal observation produces the job's single result and
//! destroys the workspace; later polls do nothing.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::postprocess::fix_line_numbers;
use crate::sentinel::{Sentinels, TerminalMarker, UNKNOWN_VERSION};
use crate::workspace::Workspace;

/// Result of one job, and the shape of every observer snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub output: String,
    pub errors: String,
    pub version: String,
}

/// Source of time for the wall-clock guard.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

/// Clock backed by the tokio timer, so paused-time tests advance it too.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Poller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    TimedOut,
}

impl JobState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut)
    }
}

/// Message appended to stderr when a job runs out of time.
pub fn timeout_message(timeout_seconds: u64) -> String {
    format!("Maximum execution time of {timeout_seconds} seconds exceeded.\n")
}

/// Watches one workspace until it reaches a terminal state.
#[derive(Debug)]
pub struct CompletionPoller {
    workspace: Workspace,
    sentinels: Sentinels,
    timeout_seconds: u64,
    limit: Duration,
    clock: Arc<dyn Clock>,
    started: Option<Instant>,
    state: JobState,
}

impl CompletionPoller {
    /// `timeout_seconds` is the job's configured limit; the wall-clock guard
    /// fires once `timeout_seconds + grace` has elapsed since [`start`].
    ///
    /// [`start`]: Self::start
    pub fn new(
        workspace: Workspace,
        timeout_seconds: u64,
        grace: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sentinels = Sentinels::new(workspace.path());
        Self {
            workspace,
            sentinels,
            timeout_seconds,
            limit: Duration::from_secs(timeout_seconds) + grace,
            clock,
            started: None,
            state: JobState::Pending,
        }
    }

    pub const fn state(&self) -> JobState {
        self.state
    }

    pub const fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Start the wall clock. Called once the sandbox has been launched.
    pub fn start(&mut self) {
        if self.state == JobState::Pending {
            self.started = Some(self.clock.now());
            self.state = JobState::Running;
        }
    }

    /// One tick of the state machine.
    ///
    /// Returns the job result on the tick that reaches a terminal state, and
    /// `None` on every other tick (including every tick after that one).
    pub async fn poll_once(&mut self) -> Option<ExecutionResult> {
        match self.state {
            JobState::Completed | JobState::TimedOut => return None,
            JobState::Pending => self.start(),
            JobState::Running => {}
        }

        if let Some(marker) = self.sentinels.terminal_marker().await {
            let timed_out = marker == TerminalMarker::TimedOut;
            return Some(self.finish(timed_out).await);
        }

        let elapsed = self
            .started
            .map_or(Duration::ZERO, |started| self.clock.now().saturating_duration_since(started));
        if elapsed > self.limit {
            info!(
                workspace = %self.workspace.path().display(),
                elapsed_ms = elapsed.as_millis(),
                "No terminal sentinel before deadline, giving up on container"
            );
            return Some(self.finish(true).await);
        }

        None
    }

    /// Poll every `interval` until the job ends.
    #[instrument(skip(self), fields(workspace = %self.workspace.path().display(), timeout = self.timeout_seconds))]
    pub async fn run(mut self, interval: Duration) -> ExecutionResult {
        self.start();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // First tick is immediate, skip it
        loop {
            ticker.tick().await;
            if let Some(result) = self.poll_once().await {
                return result;
            }
        }
    }

    async fn finish(&mut self, timed_out: bool) -> ExecutionResult {
        let output = self.sentinels.stdout().await;
        let mut errors = self.sentinels.stderr().await;
        let version = self
            .sentinels
            .version()
            .await
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string());

        if timed_out {
            errors.push_str(&timeout_message(self.timeout_seconds));
            self.state = JobState::TimedOut;
        } else {
            self.state = JobState::Completed;
        }

        debug!(state = ?self.state, "Job reached terminal state");
        self.workspace.destroy().await;

        ExecutionResult {
            output,
            errors: fix_line_numbers(&errors),
            version,
        }
    }
}
