//! Scheduler type definitions.
//!
//! This module contains error types, state enums, command types and the
//! reports produced by the scheduler.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::backend::{BackendError, ReconcileReport};
use crate::core::job::JobState;
use crate::core::types::JobId;
use crate::storage::StorageError;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Backend error.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),

    /// The requested transition is not allowed.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is running.
    Running,
    /// Scheduler is paused: no new admissions, reconciliation continues.
    Paused,
}

/// Administrative operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Stop,
    Pause,
    Resume,
    Kill,
    Retry,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Stop => "stop",
            Operation::Pause => "pause",
            Operation::Resume => "resume",
            Operation::Kill => "kill",
            Operation::Retry => "retry",
        };
        f.write_str(name)
    }
}

/// Outcome of an administrative operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationResult {
    /// The operation performed.
    pub operation: Operation,
    /// Whether it changed anything.
    pub success: bool,
}

impl OperationResult {
    pub(crate) fn new(operation: Operation, success: bool) -> Self {
        Self { operation, success }
    }
}

/// What a single scheduler tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Reconciliation outcome, if reconciliation completed.
    pub reconcile: Option<ReconcileReport>,
    /// Jobs running after reconciliation.
    pub running: usize,
    /// Jobs admitted and launched.
    pub admitted: Vec<JobId>,
    /// Candidates left waiting because an asset was locked or the job moved on.
    pub deferred: usize,
    /// Admitted jobs whose launch failed or timed out.
    pub launch_failures: Vec<JobId>,
}

/// Counters accumulated over the scheduler's lifetime.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    ticks: AtomicU64,
    ticks_skipped: AtomicU64,
    admitted: AtomicU64,
    launch_failures: AtomicU64,
    orphans: AtomicU64,
    gc_deleted: AtomicU64,
}

/// Point-in-time copy of [`SchedulerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub ticks_skipped: u64,
    pub admitted: u64,
    pub launch_failures: u64,
    pub orphans: u64,
    pub gc_deleted: u64,
}

impl SchedulerStats {
    pub(crate) fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped_tick(&self) {
        self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_launch_failure(&self) {
        self.launch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_orphans(&self, count: usize) {
        self.orphans.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_gc_deleted(&self, count: usize) {
        self.gc_deleted.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            launch_failures: self.launch_failures.load(Ordering::Relaxed),
            orphans: self.orphans.load(Ordering::Relaxed),
            gc_deleted: self.gc_deleted.load(Ordering::Relaxed),
        }
    }
}

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Stop a running job in a final state.
    StopJob {
        job_id: JobId,
        final_state: JobState,
        response: oneshot::Sender<Result<OperationResult, SchedulerError>>,
    },
    /// Kill a job.
    KillJob {
        job_id: JobId,
        response: oneshot::Sender<Result<OperationResult, SchedulerError>>,
    },
    /// Retry a job.
    RetryJob {
        job_id: JobId,
        response: oneshot::Sender<Result<OperationResult, SchedulerError>>,
    },
    /// Pause admissions.
    Pause {
        response: oneshot::Sender<OperationResult>,
    },
    /// Resume admissions.
    Resume {
        response: oneshot::Sender<OperationResult>,
    },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}
