//! Scheduler handle for controlling the scheduler.
//!
//! This module provides the `SchedulerHandle` type that allows external
//! control of a started scheduler: stopping, killing and retrying jobs,
//! pausing and resuming admissions, and shutdown.

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};

use crate::core::job::JobState;
use crate::core::types::JobId;

use super::types::{
    OperationResult, SchedulerCommand, SchedulerError, SchedulerState, SchedulerStats,
    StatsSnapshot,
};

/// Buffer size for the command channel between SchedulerHandle and Scheduler.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) state: Arc<RwLock<SchedulerState>>,
    pub(crate) stats: Arc<SchedulerStats>,
}

impl SchedulerHandle {
    /// Send a command and wait for its response.
    async fn send_command<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<T, SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })
    }

    /// Move a running job to a final state and release its locks.
    ///
    /// `final_state` must be `Success`, `Fail` or `Orphan`.
    pub async fn stop_job(
        &self,
        job_id: JobId,
        final_state: JobState,
    ) -> Result<OperationResult, SchedulerError> {
        self.send_command(
            |response| SchedulerCommand::StopJob {
                job_id,
                final_state,
                response,
            },
            "stop",
        )
        .await?
    }

    /// Kill a job: delete its cluster resources and fail it.
    pub async fn kill_job(&self, job_id: JobId) -> Result<OperationResult, SchedulerError> {
        self.send_command(
            |response| SchedulerCommand::KillJob { job_id, response },
            "kill",
        )
        .await?
    }

    /// Retry a job: delete its cluster resources and put it back in the queue.
    pub async fn retry_job(&self, job_id: JobId) -> Result<OperationResult, SchedulerError> {
        self.send_command(
            |response| SchedulerCommand::RetryJob { job_id, response },
            "retry",
        )
        .await?
    }

    /// Pause admissions. Reconciliation and garbage collection continue.
    pub async fn pause(&self) -> Result<OperationResult, SchedulerError> {
        self.send_command(|response| SchedulerCommand::Pause { response }, "pause")
            .await
    }

    /// Resume admissions after being paused.
    pub async fn resume(&self) -> Result<OperationResult, SchedulerError> {
        self.send_command(|response| SchedulerCommand::Resume { response }, "resume")
            .await
    }

    /// Shutdown the scheduler, waiting for in-flight work up to the shutdown timeout.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send_command(
            |response| SchedulerCommand::Shutdown { response },
            "shutdown",
        )
        .await
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == SchedulerState::Running
    }

    /// Check if the scheduler is paused.
    pub async fn is_paused(&self) -> bool {
        *self.state.read().await == SchedulerState::Paused
    }

    /// Current scheduler counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
