//! Kill, retry and stop integration tests.

use crate::common::Harness;
use jobwarden::backend::ExecutionStatus;
use jobwarden::testing::wait_for_state;
use jobwarden::{AssetId, InMemoryStorage, JobId, JobState, SchedulerError, StorageError};
use std::sync::Arc;
use std::time::Duration;

/// Test: Killing a running job deletes its cluster job, fails it and frees its assets.
#[tokio::test]
async fn test_kill_running_job() {
    let h = Harness::new(Arc::new(InMemoryStorage::new()), 2);
    let asset = AssetId::random();
    let job = h.submit("kill-me", &[asset]).await;
    h.scheduler.tick().await.unwrap();

    let result = h.scheduler.kill_job(&job.id).await.unwrap();

    assert!(result.success);
    assert!(h.cluster.resource_names().is_empty());
    let killed = h.jobs.get(&job.id).await.unwrap();
    assert_eq!(killed.state, JobState::Fail);
    assert!(killed.stopped_at.is_some());
    assert!(h.locks.list_by_job(&job.id).await.unwrap().is_empty());
}

/// Test: Killing a waiting job keeps it from ever being admitted.
#[tokio::test]
async fn test_kill_waiting_job() {
    let h = Harness::new(Arc::new(InMemoryStorage::new()), 2);
    let job = h.submit("never-run", &[]).await;

    assert!(h.scheduler.kill_job(&job.id).await.unwrap().success);

    let report = h.scheduler.tick().await.unwrap().unwrap();
    assert!(report.admitted.is_empty());
    assert_eq!(h.state(&job).await, JobState::Fail);
    assert!(h.cluster.submitted().is_empty());
}

/// Test: Retrying a failed job queues it again and the next tick relaunches it.
#[tokio::test]
async fn test_retry_failed_job_relaunches() {
    let h = Harness::new(Arc::new(InMemoryStorage::new()), 2);
    let asset = AssetId::random();
    let job = h.submit("flaky", &[asset]).await;
    h.scheduler.tick().await.unwrap();

    h.cluster.set_job_status(
        &job.id,
        ExecutionStatus::Failed {
            failed_at: Some(chrono::Utc::now()),
        },
    );
    h.scheduler.tick().await.unwrap();
    assert_eq!(h.state(&job).await, JobState::Fail);
    assert_eq!(h.cluster.resource_names(), vec!["flaky"]);

    let result = h.scheduler.retry_job(&job.id).await.unwrap();
    assert!(result.success);
    assert!(h.cluster.resource_names().is_empty());
    assert_eq!(h.state(&job).await, JobState::Waiting);
    assert!(h.locks.list_by_job(&job.id).await.unwrap().is_empty());

    let report = h.scheduler.tick().await.unwrap().unwrap();
    assert_eq!(report.admitted, vec![job.id]);
    assert_eq!(h.cluster.submitted().len(), 2);
    assert_eq!(h.locks.get_by_asset(&asset).await.unwrap().job_id, job.id);
}

/// Test: Retrying a running job restarts it from the queue.
#[tokio::test]
async fn test_retry_running_job() {
    let h = Harness::new(Arc::new(InMemoryStorage::new()), 2);
    let job = h.submit("restart-me", &[AssetId::random()]).await;
    h.scheduler.tick().await.unwrap();

    assert!(h.scheduler.retry_job(&job.id).await.unwrap().success);

    assert_eq!(h.state(&job).await, JobState::Waiting);
    assert!(h.locks.list_by_job(&job.id).await.unwrap().is_empty());
    assert!(h.cluster.resource_names().is_empty());
}

/// Test: Retry through the handle wakes the running loop without waiting for a tick.
#[tokio::test]
async fn test_retry_via_handle_readmits_promptly() {
    let h = Harness::new(Arc::new(InMemoryStorage::new()), 2);
    let job = h.submit("handle-retry", &[]).await;
    h.scheduler.tick().await.unwrap();
    h.scheduler.stop_job(&job.id, JobState::Fail).await.unwrap();

    let jobs = h.jobs.clone();
    let scheduler = h
        .scheduler
        .with_tick_interval(Duration::from_secs(3600))
        .with_gc_interval(Duration::from_secs(3600));
    let (handle, task) = scheduler.start().await;

    // The first interval tick fires immediately; let it pass
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.retry_job(job.id).await.unwrap().success);

    wait_for_state(jobs.as_ref(), &job.id, JobState::Running, Duration::from_secs(2))
        .await
        .unwrap();

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: Stop requests must name a final state; unknown jobs are reported.
#[tokio::test]
async fn test_stop_and_kill_validation() {
    let h = Harness::new(Arc::new(InMemoryStorage::new()), 2);
    let job = h.submit("validate-stop", &[]).await;
    h.scheduler.tick().await.unwrap();

    let result = h.scheduler.stop_job(&job.id, JobState::Waiting).await;
    assert!(matches!(result, Err(SchedulerError::InvalidState(_))));

    let result = h.scheduler.stop_job(&job.id, JobState::Success).await.unwrap();
    assert!(result.success);
    // A second stop finds the job no longer running
    let result = h.scheduler.stop_job(&job.id, JobState::Fail).await.unwrap();
    assert!(!result.success);
    assert_eq!(h.state(&job).await, JobState::Success);

    let result = h.scheduler.kill_job(&JobId::new()).await;
    assert!(matches!(
        result,
        Err(SchedulerError::Storage(StorageError::NotFound(_)))
    ));
}
