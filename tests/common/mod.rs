//! Common test utilities shared across integration tests.

use jobwarden::testing::InMemoryCluster;
use jobwarden::{
    AssetId, EventBus, FilePayloadStore, Job, JobLifecycle, JobSpec, JobState, JobStore,
    KubernetesBackend, KubernetesSettings, LockStore, OrganizationId, Scheduler,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A scheduler wired to a fake cluster over the given store.
pub struct Harness {
    pub jobs: Arc<dyn JobStore>,
    pub locks: Arc<dyn LockStore>,
    pub cluster: Arc<InMemoryCluster>,
    pub lifecycle: Arc<JobLifecycle>,
    pub events: Arc<EventBus>,
    pub scheduler: Scheduler,
    pub organization: OrganizationId,
    _payload_dir: TempDir,
}

impl Harness {
    /// Build a harness over a store implementing both store traits.
    pub fn new<S>(storage: Arc<S>, max_concurrent_jobs: usize) -> Self
    where
        S: JobStore + LockStore + 'static,
    {
        let jobs: Arc<dyn JobStore> = storage.clone();
        let locks: Arc<dyn LockStore> = storage;
        let payload_dir = TempDir::new().unwrap();
        let payloads = Arc::new(FilePayloadStore::new(payload_dir.path()));
        let events = Arc::new(EventBus::new());

        let lifecycle = Arc::new(
            JobLifecycle::new(jobs.clone(), locks.clone())
                .with_events(events.clone())
                .with_payload_store(payloads.clone()),
        );
        let cluster = Arc::new(InMemoryCluster::new());
        let backend = Arc::new(KubernetesBackend::new(
            cluster.clone(),
            lifecycle.clone(),
            payloads,
            KubernetesSettings::new("registry.example.com/worker:1.0"),
        ));

        let scheduler = Scheduler::new(lifecycle.clone(), backend)
            .with_max_concurrent_jobs(max_concurrent_jobs)
            .with_backend_timeout(Duration::from_secs(2));

        Self {
            jobs,
            locks,
            cluster,
            lifecycle,
            events,
            scheduler,
            organization: OrganizationId::random(),
            _payload_dir: payload_dir,
        }
    }

    /// Submit a job that locks the given assets and check it is queued.
    pub async fn submit(&self, name: &str, assets: &[AssetId]) -> Job {
        let mut spec = JobSpec::new(name, self.organization);
        if !assets.is_empty() {
            spec = spec.with_locked_assets(assets.iter().copied());
        }
        let job = self.lifecycle.submit(&spec).await.unwrap();
        assert_eq!(job.state, JobState::Waiting, "job {} not queued", name);
        job
    }

    /// Current state of a job.
    pub async fn state(&self, job: &Job) -> JobState {
        self.jobs.get(&job.id).await.unwrap().state
    }
}
