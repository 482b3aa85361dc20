//! Admission scenario integration tests.
//!
//! Tests that verify the scheduler admits waiting jobs oldest first, never
//! beyond the concurrency ceiling, and that a failed launch does not block
//! the rest of the tick.

use crate::common::Harness;
use async_trait::async_trait;
use jobwarden::backend::ExecutionStatus;
use jobwarden::testing::wait_for_state;
use jobwarden::{Event, EventHandler, InMemoryStorage, JobId, JobState};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records the job ids of launch failure events.
#[derive(Default)]
struct LaunchFailures(Mutex<Vec<JobId>>);

#[async_trait]
impl EventHandler for LaunchFailures {
    async fn handle(&self, event: &Event) {
        if let Event::JobLaunchFailed { job_id, .. } = event {
            self.0.lock().unwrap().push(*job_id);
        }
    }
}

/// Test: Two slots, three waiting jobs; the two oldest are admitted.
#[tokio::test]
async fn test_tick_admits_oldest_jobs_up_to_ceiling() {
    let h = Harness::new(Arc::new(InMemoryStorage::new()), 2);

    let t1 = h.submit("ingest-t1", &[]).await;
    let t2 = h.submit("ingest-t2", &[]).await;
    let t3 = h.submit("ingest-t3", &[]).await;

    let report = h.scheduler.tick().await.unwrap().unwrap();

    assert_eq!(report.admitted, vec![t1.id, t2.id]);
    assert_eq!(report.running, 2);
    assert_eq!(h.state(&t1).await, JobState::Running);
    assert_eq!(h.state(&t2).await, JobState::Running);
    assert_eq!(h.state(&t3).await, JobState::Waiting);
    assert_eq!(h.cluster.resource_names(), vec!["ingest-t1", "ingest-t2"]);
}

/// Test: A full cluster admits nothing until a running job finishes.
#[tokio::test]
async fn test_ceiling_holds_until_a_job_finishes() {
    let h = Harness::new(Arc::new(InMemoryStorage::new()), 1);

    let first = h.submit("export-1", &[]).await;
    let second = h.submit("export-2", &[]).await;

    h.scheduler.tick().await.unwrap();
    let report = h.scheduler.tick().await.unwrap().unwrap();
    assert!(report.admitted.is_empty());
    assert_eq!(h.state(&second).await, JobState::Waiting);

    h.cluster.set_job_status(
        &first.id,
        ExecutionStatus::Succeeded {
            completed_at: Some(chrono::Utc::now()),
        },
    );
    let report = h.scheduler.tick().await.unwrap().unwrap();

    assert_eq!(report.reconcile.map(|r| r.succeeded), Some(1));
    assert_eq!(report.admitted, vec![second.id]);
    assert_eq!(h.state(&first).await, JobState::Success);
    assert_eq!(h.state(&second).await, JobState::Running);
}

/// Test: A launch failure fails that job only; later candidates still launch.
#[tokio::test]
async fn test_launch_failure_does_not_block_other_candidates() {
    let h = Harness::new(Arc::new(InMemoryStorage::new()), 3);
    let failures = Arc::new(LaunchFailures::default());
    h.events.register(failures.clone()).await;

    let doomed = h.submit("batch-a", &[]).await;
    let ok_1 = h.submit("batch-b", &[]).await;
    let ok_2 = h.submit("batch-c", &[]).await;

    // A leftover cluster job with the same name makes the submit conflict
    h.cluster.insert("batch-a", None, ExecutionStatus::Active);

    let report = h.scheduler.tick().await.unwrap().unwrap();

    assert_eq!(report.launch_failures, vec![doomed.id]);
    assert_eq!(report.admitted, vec![ok_1.id, ok_2.id]);

    let doomed = h.jobs.get(&doomed.id).await.unwrap();
    assert_eq!(doomed.state, JobState::Fail);
    assert!(doomed.stopped_at.is_some());
    assert_eq!(h.state(&ok_1).await, JobState::Running);
    assert_eq!(h.state(&ok_2).await, JobState::Running);
    assert_eq!(*failures.0.lock().unwrap(), vec![doomed.id]);
    assert_eq!(h.scheduler.stats().snapshot().launch_failures, 1);
}

/// Test: The running loop admits a submitted job and reconciles it to success.
#[tokio::test]
async fn test_running_scheduler_drives_job_to_success() {
    let h = Harness::new(Arc::new(InMemoryStorage::new()), 2);
    let job = h.submit("import-loop", &[]).await;

    let jobs = h.jobs.clone();
    let cluster = h.cluster.clone();
    let scheduler = h
        .scheduler
        .with_tick_interval(Duration::from_millis(20))
        .with_gc_interval(Duration::from_secs(3600));
    let (handle, task) = scheduler.start().await;

    wait_for_state(jobs.as_ref(), &job.id, JobState::Running, Duration::from_secs(2))
        .await
        .unwrap();

    cluster.set_job_status(
        &job.id,
        ExecutionStatus::Succeeded {
            completed_at: Some(chrono::Utc::now()),
        },
    );
    let done = wait_for_state(jobs.as_ref(), &job.id, JobState::Success, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(done.started_at.is_some());
    assert!(done.stopped_at.is_some());

    handle.shutdown().await.unwrap();
    task.await.unwrap();
    assert!(handle.stats().admitted >= 1);
}

/// Test: Paused scheduler reconciles but admits nothing.
#[tokio::test]
async fn test_pause_stops_admission_until_resume() {
    let h = Harness::new(Arc::new(InMemoryStorage::new()), 2);
    let job = h.submit("paused-job", &[]).await;

    assert!(h.scheduler.pause().await.success);
    let report = h.scheduler.tick().await.unwrap().unwrap();
    assert!(report.admitted.is_empty());
    assert_eq!(h.state(&job).await, JobState::Waiting);

    assert!(h.scheduler.resume().await.success);
    let report = h.scheduler.tick().await.unwrap().unwrap();
    assert_eq!(report.admitted, vec![job.id]);
}
