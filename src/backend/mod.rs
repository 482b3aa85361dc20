//! Orchestration backends.
//!
//! An [`OrchestrationBackend`] launches admitted jobs on an execution
//! platform, kills and retries them, reconciles the store's view of running
//! jobs with what the platform reports and deletes finished resources.
//!
//! Two variants exist: [`KubernetesBackend`], which talks to a cluster through
//! the narrow [`OrchestrationClient`] interface, and [`NullBackend`], a no-op
//! for deployments without a cluster.

mod kubernetes;
pub mod manifest;
mod null;
pub mod payload;

pub use kubernetes::{KubernetesBackend, KubernetesClient, KubernetesSettings};
pub use null::NullBackend;
pub use payload::{FilePayloadStore, PayloadStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::core::job::Job;
use crate::core::types::JobId;
use crate::storage::StorageError;

/// Errors raised by backends and their collaborators.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The orchestration API answered with an error status.
    #[error("orchestration API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The orchestration API could not be reached or answered garbage.
    #[error("transport error: {0}")]
    Transport(String),

    /// Staging or signing a payload failed.
    #[error("payload error: {0}")]
    Payload(String),

    /// A backend call did not finish in time.
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    /// A store call made by the backend failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Status of an execution resource as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// No status reported yet.
    Pending,
    /// At least one pod is active.
    Active,
    /// Completed successfully.
    Succeeded { completed_at: Option<DateTime<Utc>> },
    /// Carries a `Failed` condition.
    Failed { failed_at: Option<DateTime<Utc>> },
}

impl ExecutionStatus {
    /// When the resource finished, if it did and the platform said when.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self {
            ExecutionStatus::Succeeded { completed_at } => *completed_at,
            ExecutionStatus::Failed { failed_at } => *failed_at,
            ExecutionStatus::Pending | ExecutionStatus::Active => None,
        }
    }

    /// Whether the resource has finished, successfully or not.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded { .. } | ExecutionStatus::Failed { .. }
        )
    }
}

/// An execution resource on the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResource {
    /// Resource name.
    pub name: String,
    /// Job the resource was launched for, taken from its labels.
    pub job_id: Option<JobId>,
    /// Reported status.
    pub status: ExecutionStatus,
}

/// Narrow client interface to a cluster's batch API.
#[async_trait]
pub trait OrchestrationClient: Send + Sync {
    /// Submit a resource manifest.
    async fn submit(&self, manifest: &Value) -> Result<(), BackendError>;

    /// Delete a resource by name. Deleting a missing resource succeeds.
    async fn delete(&self, name: &str) -> Result<(), BackendError>;

    /// Names of the resources carrying label `key=value`.
    async fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<String>, BackendError>;

    /// Status of a resource, or `None` if it no longer exists.
    async fn get_status(&self, name: &str) -> Result<Option<ExecutionStatus>, BackendError>;

    /// Every resource managed by this scheduler.
    async fn list_managed(&self) -> Result<Vec<ExecutionResource>, BackendError>;
}

/// Outcome of reconciling running jobs against the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Jobs inspected.
    pub checked: usize,
    /// Jobs moved to `Success`.
    pub succeeded: usize,
    /// Jobs moved to `Fail`.
    pub failed: usize,
    /// Jobs moved to `Orphan`.
    pub orphaned: Vec<JobId>,
    /// Jobs left `Running`.
    pub still_running: usize,
    /// Jobs that could not be inspected.
    pub errors: usize,
}

impl ReconcileReport {
    /// Number of jobs that left `Running` during this pass.
    pub fn finished(&self) -> usize {
        self.succeeded + self.failed + self.orphaned.len()
    }
}

/// Interface to a cluster execution platform.
#[async_trait]
pub trait OrchestrationBackend: Send + Sync {
    /// Launch a job already moved to `Running` by admission.
    async fn launch(&self, job: &Job) -> Result<(), BackendError>;

    /// Delete the job's resources and force it to `Fail`.
    ///
    /// Returns whether the state change happened.
    async fn kill(&self, job: &Job) -> Result<bool, BackendError>;

    /// Delete the job's resources and move it back to `Waiting`.
    ///
    /// Returns whether the state change happened.
    async fn retry(&self, job: &Job) -> Result<bool, BackendError>;

    /// Move running jobs whose resources finished or vanished out of `Running`.
    async fn reconcile(&self, running: &[Job]) -> Result<ReconcileReport, BackendError>;

    /// Delete finished resources older than `max_age_hours`. Returns the number deleted.
    async fn garbage_collect(&self, max_age_hours: f64) -> Result<usize, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finished_at_only_for_finished_resources() {
        let now = Utc::now();

        assert_eq!(ExecutionStatus::Pending.finished_at(), None);
        assert_eq!(ExecutionStatus::Active.finished_at(), None);
        assert_eq!(
            ExecutionStatus::Succeeded { completed_at: Some(now) }.finished_at(),
            Some(now)
        );
        assert_eq!(
            ExecutionStatus::Failed { failed_at: Some(now) }.finished_at(),
            Some(now)
        );
        assert!(ExecutionStatus::Failed { failed_at: None }.is_finished());
        assert!(!ExecutionStatus::Active.is_finished());
    }

    #[test]
    fn test_report_counts_finished_jobs() {
        let report = ReconcileReport {
            checked: 5,
            succeeded: 1,
            failed: 1,
            orphaned: vec![JobId::new()],
            still_running: 2,
            errors: 0,
        };
        assert_eq!(report.finished(), 3);
    }
}
