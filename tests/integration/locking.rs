//! Asset locking integration tests.
//!
//! Tests that verify jobs sharing an asset never run at the same time and
//! that locks are released when a job stops.

use crate::common::Harness;
use jobwarden::backend::ExecutionStatus;
use jobwarden::{AssetId, InMemoryStorage, JobSpec, JobState, JobStore, LockSpec, LockStore};
use std::sync::Arc;

/// Test: A lock on a shared asset hides every job mapped to it.
#[tokio::test]
async fn test_locked_asset_hides_waiting_jobs_until_released() {
    let storage = Arc::new(InMemoryStorage::new());
    let h = Harness::new(storage.clone(), 10);
    let a1 = AssetId::random();

    let j1 = h.submit("scan-j1", &[a1]).await;
    let j2 = h.submit("scan-j2", &[a1]).await;
    LockStore::create(storage.as_ref(), LockSpec::new(a1, j1.id))
        .await
        .unwrap();

    let waiting = storage.get_waiting(10).await.unwrap();
    assert!(waiting.is_empty());

    assert_eq!(storage.delete_by_job(&j1.id).await.unwrap(), 1);

    let waiting: Vec<_> = storage
        .get_waiting(10)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(waiting, vec![j1.id, j2.id]);
}

/// Test: Of two jobs sharing an asset, only the older one is admitted.
#[tokio::test]
async fn test_overlapping_jobs_run_one_at_a_time() {
    let h = Harness::new(Arc::new(InMemoryStorage::new()), 5);
    let shared = AssetId::random();

    let first = h.submit("overlap-1", &[shared, AssetId::random()]).await;
    let second = h.submit("overlap-2", &[shared]).await;

    let report = h.scheduler.tick().await.unwrap().unwrap();
    assert_eq!(report.admitted, vec![first.id]);
    assert_eq!(report.deferred, 1);
    assert_eq!(h.state(&second).await, JobState::Waiting);
    assert!(h.locks.list_by_job(&second.id).await.unwrap().is_empty());
    assert_eq!(h.locks.get_by_asset(&shared).await.unwrap().job_id, first.id);

    // While the lock is held the second job is not even a candidate
    let report = h.scheduler.tick().await.unwrap().unwrap();
    assert!(report.admitted.is_empty());
    assert_eq!(report.deferred, 0);

    h.cluster.set_job_status(
        &first.id,
        ExecutionStatus::Failed {
            failed_at: Some(chrono::Utc::now()),
        },
    );
    let report = h.scheduler.tick().await.unwrap().unwrap();

    assert_eq!(report.reconcile.map(|r| r.failed), Some(1));
    assert_eq!(report.admitted, vec![second.id]);
    assert_eq!(h.state(&first).await, JobState::Fail);
    assert!(h.locks.list_by_job(&first.id).await.unwrap().is_empty());
    assert_eq!(h.locks.get_by_asset(&shared).await.unwrap().job_id, second.id);
}

/// Test: Jobs with disjoint assets are admitted together.
#[tokio::test]
async fn test_disjoint_jobs_run_concurrently() {
    let h = Harness::new(Arc::new(InMemoryStorage::new()), 5);

    let a = h.submit("disjoint-a", &[AssetId::random()]).await;
    let b = h.submit("disjoint-b", &[AssetId::random(), AssetId::random()]).await;

    let report = h.scheduler.tick().await.unwrap().unwrap();

    assert_eq!(report.admitted, vec![a.id, b.id]);
    assert_eq!(h.locks.list_by_job(&a.id).await.unwrap().len(), 1);
    assert_eq!(h.locks.list_by_job(&b.id).await.unwrap().len(), 2);
}

/// Test: Jobs that do not lock assets ignore locks held on their assets.
#[tokio::test]
async fn test_non_locking_job_is_not_blocked() {
    let storage = Arc::new(InMemoryStorage::new());
    let h = Harness::new(storage.clone(), 5);
    let asset = AssetId::random();

    let holder = h.submit("holder", &[asset]).await;
    let mut spec = JobSpec::new("reader", h.organization);
    spec.assets.push(asset);
    let reader = h.lifecycle.submit(&spec).await.unwrap();

    let report = h.scheduler.tick().await.unwrap().unwrap();

    assert_eq!(report.admitted, vec![holder.id, reader.id]);
    assert!(storage.get_assets(&reader.id).await.unwrap().is_empty());
}
