//! Storage abstraction for persisting jobs, asset mappings and locks.
//!
//! Two traits split the persistence contract: [`JobStore`] owns job records,
//! their state machine and job/asset associations, [`LockStore`] owns the
//! at-most-one-lock-per-asset registry. Both backends in this module
//! (in-memory and SQLite) implement both traits on a single type so that
//! waiting-job selection can see the lock table.
//!
//! The compare-and-swap in [`JobStore::set_state`] and the uniqueness check
//! in [`LockStore::create`] are the only synchronization the scheduler relies
//! on across concurrent callers.

mod memory;
#[cfg(any(feature = "sqlite", test))]
mod sqlite;

pub use memory::InMemoryStorage;
#[cfg(any(feature = "sqlite", test))]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::job::{Job, JobSpec, JobState};
use crate::core::lock::{Lock, LockSpec};
use crate::core::types::{AssetId, JobId, LockId, OrganizationId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request was rejected before touching the store.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A uniqueness constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The underlying store failed.
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Only jobs in one of these states (empty = any state).
    pub states: Vec<JobState>,
    /// Only jobs of this organization.
    pub organization_id: Option<OrganizationId>,
    /// Maximum number of jobs to return (None = no limit).
    pub limit: Option<usize>,
    /// Number of matching jobs to skip.
    pub offset: usize,
}

impl JobFilter {
    /// Filter on a set of states.
    pub fn with_states(mut self, states: impl IntoIterator<Item = JobState>) -> Self {
        self.states = states.into_iter().collect();
        self
    }

    /// Filter on an organization.
    pub fn with_organization(mut self, organization_id: OrganizationId) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    /// Page through results.
    pub fn with_page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    /// Whether a job matches the state and organization criteria.
    pub fn matches(&self, job: &Job) -> bool {
        (self.states.is_empty() || self.states.contains(&job.state))
            && self.organization_id.is_none_or(|org| org == job.organization_id)
    }
}

/// Durable job records and their state machine.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job in the `Setup` state.
    ///
    /// Fails with [`StorageError::Validation`] if the name is empty or taken.
    async fn create(&self, spec: &JobSpec) -> Result<Job, StorageError>;

    /// Get a job by ID.
    async fn get(&self, id: &JobId) -> Result<Job, StorageError>;

    /// Get a job by its unique name.
    async fn get_by_name(&self, name: &str) -> Result<Job, StorageError>;

    /// Waiting jobs none of whose assets is locked, oldest first.
    async fn get_waiting(&self, limit: usize) -> Result<Vec<Job>, StorageError>;

    /// All running jobs.
    async fn get_running(&self) -> Result<Vec<Job>, StorageError>;

    /// List jobs matching a filter, oldest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StorageError>;

    /// Compare-and-swap the job state.
    ///
    /// Updates only if the persisted state equals `expected` (or always when
    /// `expected` is `None`). Returns whether the update happened.
    async fn set_state(
        &self,
        id: &JobId,
        new_state: JobState,
        expected: Option<JobState>,
    ) -> Result<bool, StorageError>;

    /// Associate assets with a job. Re-mapping an existing pair is a no-op.
    async fn map_assets_to_job(&self, id: &JobId, assets: &[AssetId]) -> Result<(), StorageError>;

    /// Assets associated with a job.
    async fn get_assets(&self, id: &JobId) -> Result<Vec<AssetId>, StorageError>;
}

/// Durable asset lock registry.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take a lock. Fails with [`StorageError::Conflict`] if the asset is already locked.
    async fn create(&self, spec: LockSpec) -> Result<Lock, StorageError>;

    /// Get a lock by ID.
    async fn get(&self, id: &LockId) -> Result<Lock, StorageError>;

    /// Get the lock held on an asset.
    async fn get_by_asset(&self, asset_id: &AssetId) -> Result<Lock, StorageError>;

    /// All locks owned by a job.
    async fn list_by_job(&self, job_id: &JobId) -> Result<Vec<Lock>, StorageError>;

    /// Release a single lock. Returns whether it existed.
    async fn delete(&self, id: &LockId) -> Result<bool, StorageError>;

    /// Release every lock owned by a job. Returns the number released.
    async fn delete_by_job(&self, job_id: &JobId) -> Result<usize, StorageError>;
}

/// Reject specs that can never be stored.
pub(crate) fn validate_spec(spec: &JobSpec) -> Result<(), StorageError> {
    if spec.name.trim().is_empty() {
        return Err(StorageError::Validation("job name must not be empty".into()));
    }
    Ok(())
}
