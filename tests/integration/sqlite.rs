//! The scheduling scenarios over SQLite storage.

use crate::common::Harness;
use jobwarden::backend::ExecutionStatus;
use jobwarden::{
    AssetId, JobState, JobStore, LockSpec, LockStore, SqliteStorage, StorageError,
};
use std::sync::Arc;
use tempfile::TempDir;

async fn sqlite_harness(max_concurrent_jobs: usize) -> (Arc<SqliteStorage>, Harness) {
    let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
    let harness = Harness::new(storage.clone(), max_concurrent_jobs);
    (storage, harness)
}

/// Test: Lock exclusion in waiting-job selection.
#[tokio::test]
async fn test_sqlite_locked_asset_hides_waiting_jobs() {
    let (storage, h) = sqlite_harness(10).await;
    let a1 = AssetId::random();

    let j1 = h.submit("sql-j1", &[a1]).await;
    let j2 = h.submit("sql-j2", &[a1]).await;
    LockStore::create(storage.as_ref(), LockSpec::new(a1, j1.id))
        .await
        .unwrap();
    assert!(storage.get_waiting(10).await.unwrap().is_empty());

    let duplicate = LockStore::create(storage.as_ref(), LockSpec::new(a1, j2.id)).await;
    assert!(matches!(duplicate, Err(StorageError::Conflict(_))));

    storage.delete_by_job(&j1.id).await.unwrap();
    let waiting: Vec<_> = storage
        .get_waiting(10)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(waiting, vec![j1.id, j2.id]);
}

/// Test: Ceiling and FIFO admission.
#[tokio::test]
async fn test_sqlite_tick_admits_oldest_jobs_up_to_ceiling() {
    let (_storage, h) = sqlite_harness(2).await;

    let t1 = h.submit("sql-t1", &[]).await;
    let t2 = h.submit("sql-t2", &[]).await;
    let t3 = h.submit("sql-t3", &[]).await;

    let report = h.scheduler.tick().await.unwrap().unwrap();

    assert_eq!(report.admitted, vec![t1.id, t2.id]);
    assert_eq!(h.state(&t3).await, JobState::Waiting);
    let running = h.jobs.get_running().await.unwrap();
    assert_eq!(running.len(), 2);
    assert!(running.iter().all(|job| job.started_at.is_some()));
}

/// Test: Launch failure isolation.
#[tokio::test]
async fn test_sqlite_launch_failure_does_not_block_others() {
    let (_storage, h) = sqlite_harness(2).await;

    let doomed = h.submit("sql-doomed", &[AssetId::random()]).await;
    let fine = h.submit("sql-fine", &[]).await;
    h.cluster.insert("sql-doomed", None, ExecutionStatus::Active);

    let report = h.scheduler.tick().await.unwrap().unwrap();

    assert_eq!(report.launch_failures, vec![doomed.id]);
    assert_eq!(report.admitted, vec![fine.id]);
    assert_eq!(h.state(&doomed).await, JobState::Fail);
    assert!(h.locks.list_by_job(&doomed.id).await.unwrap().is_empty());
}

/// Test: Jobs and locks survive reopening the database.
#[tokio::test]
async fn test_sqlite_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobwarden.db");
    let asset = AssetId::random();

    let job_id = {
        let storage = Arc::new(SqliteStorage::new(&path).await.unwrap());
        let h = Harness::new(storage.clone(), 1);
        let job = h.submit("durable", &[asset]).await;
        h.scheduler.tick().await.unwrap();
        storage.close().await;
        job.id
    };

    let storage = SqliteStorage::new(&path).await.unwrap();
    let job = JobStore::get(&storage, &job_id).await.unwrap();
    assert_eq!(job.state, JobState::Running);
    assert_eq!(storage.get_assets(&job_id).await.unwrap(), vec![asset]);
    assert_eq!(storage.get_by_asset(&asset).await.unwrap().job_id, job_id);
}
