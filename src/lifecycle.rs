//! Store-side job lifecycle.
//!
//! [`JobLifecycle`] owns every state transition the scheduler and the
//! backends perform: submission, admission with lock acquisition, stopping
//! with lock release and forced transitions. Each successful transition is
//! logged and published on the [`EventBus`].

use std::sync::Arc;

use crate::backend::PayloadStore;
use crate::core::job::{Job, JobSpec, JobState};
use crate::core::lock::LockSpec;
use crate::core::types::LockId;
use crate::events::{Event, EventBus};
use crate::storage::{JobStore, LockStore, StorageError};

/// Job state transitions over a job store and a lock store.
pub struct JobLifecycle {
    jobs: Arc<dyn JobStore>,
    locks: Arc<dyn LockStore>,
    events: Arc<EventBus>,
    payloads: Option<Arc<dyn PayloadStore>>,
}

impl JobLifecycle {
    /// Create a lifecycle with its own event bus and no payload store.
    pub fn new(jobs: Arc<dyn JobStore>, locks: Arc<dyn LockStore>) -> Self {
        Self {
            jobs,
            locks,
            events: Arc::new(EventBus::new()),
            payloads: None,
        }
    }

    /// Publish transitions on a shared event bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Stage submitted payloads in `payloads`.
    pub fn with_payload_store(mut self, payloads: Arc<dyn PayloadStore>) -> Self {
        self.payloads = Some(payloads);
        self
    }

    /// The job store.
    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// The lock store.
    pub fn locks(&self) -> &Arc<dyn LockStore> {
        &self.locks
    }

    /// The event bus transitions are published on.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Create a job and make it schedulable.
    ///
    /// Maps the spec's assets when it locks them, stages the payload and
    /// moves the job from `Setup` to `Waiting`. A job whose payload cannot be
    /// staged is forced to `Fail` and returned. A failed asset mapping also
    /// fails the job, and the error is returned.
    pub async fn submit(&self, spec: &JobSpec) -> Result<Job, StorageError> {
        let job = self.jobs.create(spec).await?;
        tracing::info!(job_id = %job.id, job = %job.name, job_type = %job.job_type, "created job");

        if spec.lock_assets && !spec.assets.is_empty() {
            if let Err(e) = self.jobs.map_assets_to_job(&job.id, &spec.assets).await {
                tracing::error!(job_id = %job.id, error = %e, "failed to map job assets");
                self.force_state(&job, JobState::Fail).await?;
                return Err(e);
            }
        }

        if let (Some(payload), Some(store)) = (&spec.payload, &self.payloads) {
            if let Err(e) = store.stage(&job, payload).await {
                tracing::error!(job_id = %job.id, error = %e, "failed to stage job payload");
                self.force_state(&job, JobState::Fail).await?;
                return self.jobs.get(&job.id).await;
            }
        }

        self.set_state(&job, JobState::Waiting, Some(JobState::Setup))
            .await?;
        self.jobs.get(&job.id).await
    }

    /// Admit a waiting job.
    ///
    /// Locks every mapped asset when the job locks assets, then moves it from
    /// `Waiting` to `Running`. Returns `Ok(false)` and leaves the job waiting
    /// if an asset is locked by another job or the job is no longer waiting.
    /// Only locks taken by this call are released on the way out; a job found
    /// already holding one of its assets was admitted elsewhere and keeps it.
    pub async fn start(&self, job: &Job) -> Result<bool, StorageError> {
        let mut taken = Vec::new();
        if job.lock_assets {
            let assets = self.jobs.get_assets(&job.id).await?;
            for asset in assets {
                match self.locks.create(LockSpec::new(asset, job.id)).await {
                    Ok(lock) => taken.push(lock.id),
                    Err(StorageError::Conflict(reason)) => {
                        let held_by_job = match self.locks.get_by_asset(&asset).await {
                            Ok(lock) => lock.job_id == job.id,
                            Err(StorageError::NotFound(_)) => false,
                            Err(e) => {
                                self.release_after_error(job, &taken).await;
                                return Err(e);
                            }
                        };
                        if held_by_job {
                            tracing::debug!(job_id = %job.id, asset_id = %asset, "job already holds asset, skipping admission");
                        } else {
                            tracing::debug!(job_id = %job.id, asset_id = %asset, reason = %reason, "asset locked, deferring job");
                        }
                        self.release(&taken).await?;
                        return Ok(false);
                    }
                    Err(e) => {
                        self.release_after_error(job, &taken).await;
                        return Err(e);
                    }
                }
            }
        }

        match self
            .set_state(job, JobState::Running, Some(JobState::Waiting))
            .await
        {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.release(&taken).await?;
                Ok(false)
            }
            Err(e) => {
                self.release_after_error(job, &taken).await;
                Err(e)
            }
        }
    }

    /// Move a running job to `final_state`, releasing its locks on success.
    pub async fn stop(&self, job: &Job, final_state: JobState) -> Result<bool, StorageError> {
        let stopped = self
            .set_state(job, final_state, Some(JobState::Running))
            .await?;
        if stopped {
            self.clear_locks(job).await?;
        }
        Ok(stopped)
    }

    /// Compare-and-swap the job state, publishing the change if it happened.
    pub async fn set_state(
        &self,
        job: &Job,
        new_state: JobState,
        expected: Option<JobState>,
    ) -> Result<bool, StorageError> {
        let changed = self.jobs.set_state(&job.id, new_state, expected).await?;
        if changed {
            tracing::info!(job_id = %job.id, job = %job.name, state = %new_state, "job state changed");
            self.events
                .emit(Event::state_changed(job.id, job.name.clone(), expected, new_state))
                .await;
        } else {
            tracing::debug!(
                job_id = %job.id,
                state = %new_state,
                expected = ?expected,
                "job state unchanged, expected state did not match"
            );
        }
        Ok(changed)
    }

    /// Set the job state regardless of its current state.
    pub async fn force_state(&self, job: &Job, new_state: JobState) -> Result<bool, StorageError> {
        self.set_state(job, new_state, None).await
    }

    /// Release every lock held by the job. Returns the number released.
    pub async fn clear_locks(&self, job: &Job) -> Result<usize, StorageError> {
        let released = self.locks.delete_by_job(&job.id).await?;
        if released > 0 {
            tracing::debug!(job_id = %job.id, released, "released asset locks");
        }
        Ok(released)
    }

    async fn release(&self, taken: &[LockId]) -> Result<(), StorageError> {
        for id in taken {
            self.locks.delete(id).await?;
        }
        Ok(())
    }

    async fn release_after_error(&self, job: &Job, taken: &[LockId]) {
        if let Err(e) = self.release(taken).await {
            tracing::error!(job_id = %job.id, error = %e, "failed to release locks after admission error");
        }
    }
}
