use async_trait::async_trait;

use super::{BackendError, OrchestrationBackend, ReconcileReport};
use crate::core::job::Job;

/// Backend for deployments without a cluster. Every call succeeds and does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackend;

#[async_trait]
impl OrchestrationBackend for NullBackend {
    async fn launch(&self, job: &Job) -> Result<(), BackendError> {
        tracing::debug!(job_id = %job.id, "null backend: launch ignored");
        Ok(())
    }

    async fn kill(&self, _job: &Job) -> Result<bool, BackendError> {
        Ok(true)
    }

    async fn retry(&self, _job: &Job) -> Result<bool, BackendError> {
        Ok(true)
    }

    async fn reconcile(&self, _running: &[Job]) -> Result<ReconcileReport, BackendError> {
        Ok(ReconcileReport::default())
    }

    async fn garbage_collect(&self, _max_age_hours: f64) -> Result<usize, BackendError> {
        Ok(0)
    }
}
