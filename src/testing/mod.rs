//! Testing utilities for users of the jobwarden library.
//!
//! This module provides helpers for exercising the scheduler without a
//! cluster or a database:
//!
//! - [`InMemoryCluster`]: an [`OrchestrationClient`] keeping cluster Jobs in memory
//! - [`FailingStorage`]: a store wrapper that fails selected operations on demand
//! - [`wait_for_state`]: poll a store until a job reaches a state

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::backend::manifest::JOB_ID_LABEL;
use crate::backend::{BackendError, ExecutionResource, ExecutionStatus, OrchestrationClient};
use crate::core::job::{Job, JobSpec, JobState};
use crate::core::lock::{Lock, LockSpec};
use crate::core::types::{AssetId, JobId, LockId};
use crate::storage::{InMemoryStorage, JobFilter, JobStore, LockStore, StorageError};

#[derive(Debug, Clone)]
struct ClusterJob {
    labels: BTreeMap<String, String>,
    status: ExecutionStatus,
}

#[derive(Default)]
struct ClusterState {
    jobs: BTreeMap<String, ClusterJob>,
    submitted: Vec<Value>,
    fail_submit: bool,
    fail_list: bool,
    submit_delay: Option<Duration>,
}

/// A fake cluster batch API.
///
/// Submitted manifests become resources named after `metadata.name`, labeled
/// with `metadata.labels` and in the `Pending` status. Tests drive their
/// status with [`set_status`](Self::set_status) and
/// [`set_job_status`](Self::set_job_status).
///
/// # Example
///
/// ```
/// use jobwarden::backend::ExecutionStatus;
/// use jobwarden::testing::InMemoryCluster;
///
/// let cluster = InMemoryCluster::new();
/// cluster.insert("ingest-1", None, ExecutionStatus::Active);
/// assert_eq!(cluster.resource_names(), vec!["ingest-1".to_string()]);
/// ```
#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
}

impl InMemoryCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a managed resource directly, optionally correlated with a job.
    pub fn insert(&self, name: impl Into<String>, job_id: Option<JobId>, status: ExecutionStatus) {
        let mut labels = BTreeMap::new();
        labels.insert(
            JOB_ID_LABEL.to_string(),
            job_id.map(|id| id.to_string()).unwrap_or_default(),
        );
        self.state()
            .jobs
            .insert(name.into(), ClusterJob { labels, status });
    }

    /// Set the status of a resource by name. Unknown names are ignored.
    pub fn set_status(&self, name: &str, status: ExecutionStatus) {
        if let Some(job) = self.state().jobs.get_mut(name) {
            job.status = status;
        }
    }

    /// Set the status of every resource launched for a job.
    pub fn set_job_status(&self, job_id: &JobId, status: ExecutionStatus) {
        let id = job_id.to_string();
        for job in self.state().jobs.values_mut() {
            if job.labels.get(JOB_ID_LABEL) == Some(&id) {
                job.status = status;
            }
        }
    }

    /// Remove a resource without going through the API, as an operator would.
    pub fn remove(&self, name: &str) -> bool {
        self.state().jobs.remove(name).is_some()
    }

    /// Names of all resources, sorted.
    pub fn resource_names(&self) -> Vec<String> {
        self.state().jobs.keys().cloned().collect()
    }

    /// Every manifest submitted so far.
    pub fn submitted(&self) -> Vec<Value> {
        self.state().submitted.clone()
    }

    /// Make `submit` fail with an API error.
    pub fn set_fail_submit(&self, fail: bool) {
        self.state().fail_submit = fail;
    }

    /// Make listing calls fail with a transport error.
    pub fn set_fail_list(&self, fail: bool) {
        self.state().fail_list = fail;
    }

    /// Delay `submit` before it takes effect.
    pub fn set_submit_delay(&self, delay: Option<Duration>) {
        self.state().submit_delay = delay;
    }
}

#[async_trait]
impl OrchestrationClient for InMemoryCluster {
    async fn submit(&self, manifest: &Value) -> Result<(), BackendError> {
        let delay = self.state().submit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.fail_submit {
            return Err(BackendError::Api {
                status: 500,
                message: "injected submit failure".into(),
            });
        }

        let metadata = &manifest["metadata"];
        let name = metadata["name"]
            .as_str()
            .ok_or_else(|| BackendError::Api {
                status: 422,
                message: "manifest has no name".into(),
            })?
            .to_string();
        if state.jobs.contains_key(&name) {
            return Err(BackendError::Api {
                status: 409,
                message: format!("jobs.batch \"{}\" already exists", name),
            });
        }

        let labels = metadata["labels"]
            .as_object()
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        state.jobs.insert(
            name,
            ClusterJob {
                labels,
                status: ExecutionStatus::Pending,
            },
        );
        state.submitted.push(manifest.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), BackendError> {
        self.state().jobs.remove(name);
        Ok(())
    }

    async fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<String>, BackendError> {
        let state = self.state();
        if state.fail_list {
            return Err(BackendError::Transport("injected list failure".into()));
        }
        Ok(state
            .jobs
            .iter()
            .filter(|(_, job)| job.labels.get(key).map(String::as_str) == Some(value))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn get_status(&self, name: &str) -> Result<Option<ExecutionStatus>, BackendError> {
        Ok(self.state().jobs.get(name).map(|job| job.status))
    }

    async fn list_managed(&self) -> Result<Vec<ExecutionResource>, BackendError> {
        let state = self.state();
        if state.fail_list {
            return Err(BackendError::Transport("injected list failure".into()));
        }
        Ok(state
            .jobs
            .iter()
            .filter(|(_, job)| job.labels.contains_key(JOB_ID_LABEL))
            .map(|(name, job)| ExecutionResource {
                name: name.clone(),
                job_id: job
                    .labels
                    .get(JOB_ID_LABEL)
                    .and_then(|id| id.parse().ok()),
                status: job.status,
            })
            .collect())
    }
}

/// A storage wrapper that can be configured to fail specific operations.
///
/// Wraps [`InMemoryStorage`] and selectively returns
/// [`StorageError::Persistence`].
#[derive(Default)]
pub struct FailingStorage {
    inner: InMemoryStorage,
    fail_get_running: AtomicBool,
    fail_get_waiting: AtomicBool,
    fail_set_state: AtomicBool,
    fail_create_lock: AtomicBool,
    lock_creates_before_failure: Mutex<Option<usize>>,
}

impl FailingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_get_running(&self, fail: bool) {
        self.fail_get_running.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_get_waiting(&self, fail: bool) {
        self.fail_get_waiting.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_set_state(&self, fail: bool) {
        self.fail_set_state.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_create_lock(&self, fail: bool) {
        self.fail_create_lock.store(fail, Ordering::SeqCst);
    }

    /// Let `count` more lock creations succeed, then fail every one after.
    pub fn fail_create_lock_after(&self, count: usize) {
        *self
            .lock_creates_before_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(count);
    }

    fn check_lock_budget(&self) -> Result<(), StorageError> {
        let mut remaining = self
            .lock_creates_before_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match remaining.as_mut() {
            Some(0) => Err(StorageError::Persistence(
                "injected create_lock error".into(),
            )),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn check(flag: &AtomicBool, operation: &str) -> Result<(), StorageError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StorageError::Persistence(format!(
                "injected {} error",
                operation
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FailingStorage {
    async fn create(&self, spec: &JobSpec) -> Result<Job, StorageError> {
        JobStore::create(&self.inner, spec).await
    }

    async fn get(&self, id: &JobId) -> Result<Job, StorageError> {
        JobStore::get(&self.inner, id).await
    }

    async fn get_by_name(&self, name: &str) -> Result<Job, StorageError> {
        self.inner.get_by_name(name).await
    }

    async fn get_waiting(&self, limit: usize) -> Result<Vec<Job>, StorageError> {
        Self::check(&self.fail_get_waiting, "get_waiting")?;
        self.inner.get_waiting(limit).await
    }

    async fn get_running(&self) -> Result<Vec<Job>, StorageError> {
        Self::check(&self.fail_get_running, "get_running")?;
        self.inner.get_running().await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StorageError> {
        self.inner.list(filter).await
    }

    async fn set_state(
        &self,
        id: &JobId,
        new_state: JobState,
        expected: Option<JobState>,
    ) -> Result<bool, StorageError> {
        Self::check(&self.fail_set_state, "set_state")?;
        self.inner.set_state(id, new_state, expected).await
    }

    async fn map_assets_to_job(&self, id: &JobId, assets: &[AssetId]) -> Result<(), StorageError> {
        self.inner.map_assets_to_job(id, assets).await
    }

    async fn get_assets(&self, id: &JobId) -> Result<Vec<AssetId>, StorageError> {
        self.inner.get_assets(id).await
    }
}

#[async_trait]
impl LockStore for FailingStorage {
    async fn create(&self, spec: LockSpec) -> Result<Lock, StorageError> {
        Self::check(&self.fail_create_lock, "create_lock")?;
        self.check_lock_budget()?;
        LockStore::create(&self.inner, spec).await
    }

    async fn get(&self, id: &LockId) -> Result<Lock, StorageError> {
        LockStore::get(&self.inner, id).await
    }

    async fn get_by_asset(&self, asset_id: &AssetId) -> Result<Lock, StorageError> {
        self.inner.get_by_asset(asset_id).await
    }

    async fn list_by_job(&self, job_id: &JobId) -> Result<Vec<Lock>, StorageError> {
        self.inner.list_by_job(job_id).await
    }

    async fn delete(&self, id: &LockId) -> Result<bool, StorageError> {
        self.inner.delete(id).await
    }

    async fn delete_by_job(&self, job_id: &JobId) -> Result<usize, StorageError> {
        self.inner.delete_by_job(job_id).await
    }
}

/// Wait for a job to reach a state, polling the store every 10ms.
///
/// Returns the job once it is in `expected`, or an error describing the last
/// observed state once `timeout` has elapsed.
pub async fn wait_for_state(
    store: &dyn JobStore,
    job_id: &JobId,
    expected: JobState,
    timeout: Duration,
) -> Result<Job, String> {
    let start = tokio::time::Instant::now();
    loop {
        let job = store.get(job_id).await.map_err(|e| e.to_string())?;
        if job.state == expected {
            return Ok(job);
        }
        if start.elapsed() > timeout {
            return Err(format!(
                "timeout waiting for job {} to reach {}, current state: {}",
                job_id, expected, job.state
            ));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
