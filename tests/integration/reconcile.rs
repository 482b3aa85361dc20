//! Reconciliation and garbage collection integration tests.

use crate::common::Harness;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use jobwarden::backend::ExecutionStatus;
use jobwarden::{AssetId, Event, EventHandler, InMemoryStorage, JobId, JobState};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Orphans(Mutex<Vec<JobId>>);

#[async_trait]
impl EventHandler for Orphans {
    async fn handle(&self, event: &Event) {
        if let Event::JobOrphaned { job_id, .. } = event {
            self.0.lock().unwrap().push(*job_id);
        }
    }
}

fn finished_hours_ago(hours: i64) -> ExecutionStatus {
    ExecutionStatus::Succeeded {
        completed_at: Some(Utc::now() - ChronoDuration::hours(hours)),
    }
}

/// Test: A running job whose cluster job vanished is orphaned and frees its assets.
#[tokio::test]
async fn test_vanished_cluster_job_is_orphaned() {
    let h = Harness::new(Arc::new(InMemoryStorage::new()), 1);
    let orphans = Arc::new(Orphans::default());
    h.events.register(orphans.clone()).await;
    let asset = AssetId::random();

    let lost = h.submit("lost-job", &[asset]).await;
    let next = h.submit("next-job", &[asset]).await;
    h.scheduler.tick().await.unwrap();
    assert_eq!(h.state(&lost).await, JobState::Running);

    assert!(h.cluster.remove("lost-job"));
    let report = h.scheduler.tick().await.unwrap().unwrap();

    assert_eq!(report.reconcile.unwrap().orphaned, vec![lost.id]);
    let lost = h.jobs.get(&lost.id).await.unwrap();
    assert_eq!(lost.state, JobState::Orphan);
    assert!(lost.stopped_at.is_some());
    assert_eq!(*orphans.0.lock().unwrap(), vec![lost.id]);

    assert_eq!(report.admitted, vec![next.id]);
    assert_eq!(h.locks.get_by_asset(&asset).await.unwrap().job_id, next.id);
    assert_eq!(h.scheduler.stats().snapshot().orphans, 1);
}

/// Test: Pending and active cluster jobs leave the job running.
#[tokio::test]
async fn test_unfinished_cluster_job_keeps_job_running() {
    let h = Harness::new(Arc::new(InMemoryStorage::new()), 2);
    let job = h.submit("long-job", &[]).await;
    h.scheduler.tick().await.unwrap();

    let report = h.scheduler.tick().await.unwrap().unwrap();
    assert_eq!(report.reconcile.as_ref().map(|r| r.still_running), Some(1));

    h.cluster.set_job_status(&job.id, ExecutionStatus::Active);
    let report = h.scheduler.tick().await.unwrap().unwrap();
    let reconciled = report.reconcile.unwrap();
    assert_eq!(reconciled.still_running, 1);
    assert_eq!(reconciled.finished(), 0);
    assert_eq!(h.state(&job).await, JobState::Running);
}

/// Test: A cluster outage during reconciliation changes no job state.
#[tokio::test]
async fn test_cluster_outage_leaves_jobs_running() {
    let h = Harness::new(Arc::new(InMemoryStorage::new()), 2);
    let job = h.submit("steady-job", &[]).await;
    h.scheduler.tick().await.unwrap();

    h.cluster.set_fail_list(true);
    let report = h.scheduler.tick().await.unwrap().unwrap();

    let reconciled = report.reconcile.unwrap();
    assert_eq!(reconciled.errors, 1);
    assert!(reconciled.orphaned.is_empty());
    assert_eq!(h.state(&job).await, JobState::Running);
}

/// Test: Only finished cluster jobs older than the age limit are collected.
#[tokio::test]
async fn test_garbage_collection_respects_age() {
    let h = Harness::new(Arc::new(InMemoryStorage::new()), 2);
    let scheduler = h.scheduler.with_max_job_age_hours(24.0);

    h.cluster.insert("old-success", Some(JobId::new()), finished_hours_ago(48));
    h.cluster.insert(
        "old-failure",
        Some(JobId::new()),
        ExecutionStatus::Failed {
            failed_at: Some(Utc::now() - ChronoDuration::hours(30)),
        },
    );
    h.cluster.insert("recent", Some(JobId::new()), finished_hours_ago(2));
    h.cluster.insert("active", Some(JobId::new()), ExecutionStatus::Active);

    let deleted = scheduler.collect_garbage().await.unwrap();

    assert_eq!(deleted, Some(2));
    assert_eq!(h.cluster.resource_names(), vec!["active", "recent"]);
    assert_eq!(scheduler.stats().snapshot().gc_deleted, 2);
}

/// Test: A second collection with nothing changed deletes nothing.
#[tokio::test]
async fn test_garbage_collection_is_idempotent() {
    let h = Harness::new(Arc::new(InMemoryStorage::new()), 2);
    h.cluster.insert("stale-1", Some(JobId::new()), finished_hours_ago(72));
    h.cluster.insert("stale-2", Some(JobId::new()), finished_hours_ago(25));
    h.cluster.insert("fresh", Some(JobId::new()), finished_hours_ago(1));

    assert_eq!(h.scheduler.collect_garbage().await.unwrap(), Some(2));
    assert_eq!(h.scheduler.collect_garbage().await.unwrap(), Some(0));
    assert_eq!(h.cluster.resource_names(), vec!["fresh"]);
}
