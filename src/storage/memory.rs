//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and local runs.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use super::{JobFilter, JobStore, LockStore, StorageError, validate_spec};
use crate::core::job::{Job, JobSpec, JobState};
use crate::core::lock::{Lock, LockSpec};
use crate::core::types::{AssetId, JobId, LockId};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    names: HashMap<String, JobId>,
    job_assets: HashMap<JobId, Vec<AssetId>>,
    locks: HashMap<LockId, Lock>,
    locks_by_asset: HashMap<AssetId, LockId>,
}

/// In-memory storage backend.
///
/// All tables live behind one RwLock so that waiting-job selection sees
/// jobs, asset mappings and locks at the same instant.
/// Data is not persisted across restarts.
pub struct InMemoryStorage {
    inner: RwLock<Inner>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn oldest_first(a: &Job, b: &Job) -> std::cmp::Ordering {
    a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))
}

#[async_trait]
impl JobStore for InMemoryStorage {
    async fn create(&self, spec: &JobSpec) -> Result<Job, StorageError> {
        validate_spec(spec)?;
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if inner.names.contains_key(&spec.name) {
            return Err(StorageError::Validation(format!(
                "job name already in use: {}",
                spec.name
            )));
        }
        let job = Job::from_spec(spec);
        inner.names.insert(job.name.clone(), job.id);
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: &JobId) -> Result<Job, StorageError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        inner
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))
    }

    async fn get_by_name(&self, name: &str) -> Result<Job, StorageError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        inner
            .names
            .get(name)
            .and_then(|id| inner.jobs.get(id))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", name)))
    }

    async fn get_waiting(&self, limit: usize) -> Result<Vec<Job>, StorageError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|job| job.state == JobState::Waiting)
            .filter(|job| {
                inner.job_assets.get(&job.id).is_none_or(|assets| {
                    !assets
                        .iter()
                        .any(|asset| inner.locks_by_asset.contains_key(asset))
                })
            })
            .cloned()
            .collect();
        result.sort_by(oldest_first);
        result.truncate(limit);
        Ok(result)
    }

    async fn get_running(&self) -> Result<Vec<Job>, StorageError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|job| job.state == JobState::Running)
            .cloned()
            .collect();
        result.sort_by(oldest_first);
        Ok(result)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StorageError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        result.sort_by(oldest_first);
        Ok(result
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn set_state(
        &self,
        id: &JobId,
        new_state: JobState,
        expected: Option<JobState>,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let Some(job) = inner.jobs.get_mut(id) else {
            return Ok(false);
        };
        if expected.is_some_and(|expected| job.state != expected) {
            return Ok(false);
        }
        job.apply_state(new_state, Utc::now());
        Ok(true)
    }

    async fn map_assets_to_job(&self, id: &JobId, assets: &[AssetId]) -> Result<(), StorageError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if !inner.jobs.contains_key(id) {
            return Err(StorageError::NotFound(format!("job: {}", id)));
        }
        let mapped = inner.job_assets.entry(*id).or_default();
        let mut seen: HashSet<AssetId> = mapped.iter().copied().collect();
        for asset in assets {
            if seen.insert(*asset) {
                mapped.push(*asset);
            }
        }
        Ok(())
    }

    async fn get_assets(&self, id: &JobId) -> Result<Vec<AssetId>, StorageError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.job_assets.get(id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl LockStore for InMemoryStorage {
    async fn create(&self, spec: LockSpec) -> Result<Lock, StorageError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if inner.locks_by_asset.contains_key(&spec.asset_id) {
            return Err(StorageError::Conflict(format!(
                "asset already locked: {}",
                spec.asset_id
            )));
        }
        let lock = Lock::from_spec(spec);
        inner.locks_by_asset.insert(lock.asset_id, lock.id);
        inner.locks.insert(lock.id, lock.clone());
        Ok(lock)
    }

    async fn get(&self, id: &LockId) -> Result<Lock, StorageError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        inner
            .locks
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("lock: {}", id)))
    }

    async fn get_by_asset(&self, asset_id: &AssetId) -> Result<Lock, StorageError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        inner
            .locks_by_asset
            .get(asset_id)
            .and_then(|id| inner.locks.get(id))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("lock on asset: {}", asset_id)))
    }

    async fn list_by_job(&self, job_id: &JobId) -> Result<Vec<Lock>, StorageError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = inner
            .locks
            .values()
            .filter(|lock| &lock.job_id == job_id)
            .cloned()
            .collect();
        result.sort_by_key(|lock| lock.id);
        Ok(result)
    }

    async fn delete(&self, id: &LockId) -> Result<bool, StorageError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        match inner.locks.remove(id) {
            Some(lock) => {
                inner.locks_by_asset.remove(&lock.asset_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_by_job(&self, job_id: &JobId) -> Result<usize, StorageError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let owned: Vec<Lock> = inner
            .locks
            .values()
            .filter(|lock| &lock.job_id == job_id)
            .cloned()
            .collect();
        for lock in &owned {
            inner.locks.remove(&lock.id);
            inner.locks_by_asset.remove(&lock.asset_id);
        }
        Ok(owned.len())
    }
}

fn poisoned() -> StorageError {
    StorageError::Persistence("storage lock poisoned".into())
}
