//! Scheduler engine implementation.
//!
//! The scheduler is responsible for:
//! - Reconciling running jobs against the orchestration backend
//! - Admitting waiting jobs up to the concurrency ceiling
//! - Garbage collecting finished backend resources on its own interval
//! - Stop, kill and retry requests
//! - Pause and resume of admissions

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, RwLock, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, timeout};

use crate::backend::{BackendError, OrchestrationBackend};
use crate::core::job::{Job, JobState};
use crate::core::types::JobId;
use crate::events::Event;
use crate::lifecycle::JobLifecycle;

use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::types::{
    Operation, OperationResult, SchedulerCommand, SchedulerError, SchedulerState, SchedulerStats,
    TickReport,
};

/// Resets a single-flight flag when dropped.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Reconciliation and admission control loop.
pub struct Scheduler {
    /// Store-side state transitions.
    lifecycle: Arc<JobLifecycle>,
    /// Execution platform.
    backend: Arc<dyn OrchestrationBackend>,
    /// Maximum number of jobs running at once.
    max_concurrent_jobs: usize,
    /// Age after which finished backend resources are deleted.
    max_job_age_hours: f64,
    /// Interval between ticks.
    tick_interval: Duration,
    /// Interval between garbage collection passes.
    gc_interval: Duration,
    /// Bound on every backend call.
    backend_timeout: Duration,
    /// Graceful shutdown timeout (default: 30 seconds).
    shutdown_timeout: Duration,
    ticking: AtomicBool,
    collecting: AtomicBool,
    paused: AtomicBool,
    state: Arc<RwLock<SchedulerState>>,
    stats: Arc<SchedulerStats>,
    wake: Notify,
}

impl Scheduler {
    /// Create a scheduler over a lifecycle and a backend.
    pub fn new(lifecycle: Arc<JobLifecycle>, backend: Arc<dyn OrchestrationBackend>) -> Self {
        Self {
            lifecycle,
            backend,
            max_concurrent_jobs: 2,
            max_job_age_hours: 24.0,
            tick_interval: Duration::from_secs(10),
            gc_interval: Duration::from_secs(60),
            backend_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            ticking: AtomicBool::new(false),
            collecting: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            state: Arc::new(RwLock::new(SchedulerState::Stopped)),
            stats: Arc::new(SchedulerStats::default()),
            wake: Notify::new(),
        }
    }

    /// Set the maximum number of concurrently running jobs.
    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    /// Set the age in hours after which finished backend resources are deleted.
    pub fn with_max_job_age_hours(mut self, hours: f64) -> Self {
        self.max_job_age_hours = hours;
        self
    }

    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the garbage collection interval.
    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Set the timeout applied to every backend call.
    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// The lifecycle this scheduler drives.
    pub fn lifecycle(&self) -> &Arc<JobLifecycle> {
        &self.lifecycle
    }

    /// Scheduler counters.
    pub fn stats(&self) -> &Arc<SchedulerStats> {
        &self.stats
    }

    /// Whether admissions are paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Start the scheduler and return a handle for controlling it.
    pub async fn start(self) -> (SchedulerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        *self.state.write().await = if self.is_paused() {
            SchedulerState::Paused
        } else {
            SchedulerState::Running
        };

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
        };

        tracing::info!(
            max_concurrent_jobs = self.max_concurrent_jobs,
            tick_interval = ?self.tick_interval,
            gc_interval = ?self.gc_interval,
            "scheduler started"
        );

        let scheduler = Arc::new(self);
        let scheduler_task = tokio::spawn(scheduler.run(command_rx));

        (handle, scheduler_task)
    }

    /// Main scheduler loop.
    async fn run(self: Arc<Self>, mut command_rx: mpsc::Receiver<SchedulerCommand>) {
        let mut ticks = tokio::time::interval(self.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut gc_ticks = tokio::time::interval(self.gc_interval);
        gc_ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticks.tick() => self.spawn_tick(&mut tasks),

                _ = self.wake.notified() => self.spawn_tick(&mut tasks),

                _ = gc_ticks.tick() => {
                    let this = Arc::clone(&self);
                    tasks.spawn(async move {
                        if let Err(e) = this.collect_garbage().await {
                            tracing::warn!(error = %e, "garbage collection failed");
                        }
                    });
                }

                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "scheduler task panicked");
                    }
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        SchedulerCommand::StopJob { job_id, final_state, response } => {
                            let this = Arc::clone(&self);
                            tasks.spawn(async move {
                                let _ = response.send(this.stop_job(&job_id, final_state).await);
                            });
                        }
                        SchedulerCommand::KillJob { job_id, response } => {
                            let this = Arc::clone(&self);
                            tasks.spawn(async move {
                                let _ = response.send(this.kill_job(&job_id).await);
                            });
                        }
                        SchedulerCommand::RetryJob { job_id, response } => {
                            let this = Arc::clone(&self);
                            tasks.spawn(async move {
                                let _ = response.send(this.retry_job(&job_id).await);
                            });
                        }
                        SchedulerCommand::Pause { response } => {
                            let _ = response.send(self.pause().await);
                        }
                        SchedulerCommand::Resume { response } => {
                            let _ = response.send(self.resume().await);
                        }
                        SchedulerCommand::Shutdown { response } => {
                            *self.state.write().await = SchedulerState::Stopped;
                            self.drain(&mut tasks).await;
                            tracing::info!("scheduler stopped");
                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }
    }

    fn spawn_tick(self: &Arc<Self>, tasks: &mut JoinSet<()>) {
        let this = Arc::clone(self);
        tasks.spawn(async move {
            match this.tick().await {
                Ok(Some(report)) if !report.admitted.is_empty() || !report.launch_failures.is_empty() => {
                    tracing::debug!(
                        admitted = report.admitted.len(),
                        launch_failures = report.launch_failures.len(),
                        running = report.running,
                        "tick finished"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "scheduler tick failed"),
            }
        });
    }

    /// Wait for in-flight ticks and requests, up to the shutdown timeout.
    async fn drain(&self, tasks: &mut JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }

        tracing::info!(
            in_flight = tasks.len(),
            timeout = ?self.shutdown_timeout,
            "waiting for in-flight scheduler work"
        );
        let finished = timeout(self.shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if finished.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                "shutdown timeout exceeded, aborting in-flight scheduler work"
            );
            tasks.abort_all();
        }
    }

    /// Run one reconciliation and admission pass.
    ///
    /// Returns `Ok(None)` without doing anything if another tick is in flight.
    /// Failures of individual jobs are logged and do not fail the tick; only
    /// failing to read the job store does.
    pub async fn tick(&self) -> Result<Option<TickReport>, SchedulerError> {
        let Some(_guard) = FlightGuard::acquire(&self.ticking) else {
            tracing::debug!("previous tick still in flight, skipping");
            self.stats.record_skipped_tick();
            return Ok(None);
        };
        self.stats.record_tick();

        let jobs = self.lifecycle.jobs();
        let mut report = TickReport::default();

        let running = jobs.get_running().await?;
        if !running.is_empty() {
            match timeout(self.backend_timeout, self.backend.reconcile(&running)).await {
                Ok(Ok(reconciled)) => {
                    self.stats.record_orphans(reconciled.orphaned.len());
                    report.reconcile = Some(reconciled);
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "reconciliation failed"),
                Err(_) => tracing::warn!(timeout = ?self.backend_timeout, "reconciliation timed out"),
            }
        }

        if self.is_paused() {
            tracing::debug!("scheduler paused, skipping admission");
            return Ok(Some(report));
        }

        report.running = jobs.get_running().await?.len();
        if report.running >= self.max_concurrent_jobs {
            return Ok(Some(report));
        }

        let candidates = jobs
            .get_waiting(self.max_concurrent_jobs - report.running)
            .await?;
        for job in candidates {
            match self.lifecycle.start(&job).await {
                Ok(true) => {}
                Ok(false) => {
                    report.deferred += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "failed to admit job");
                    continue;
                }
            }

            match self.launch(&job).await {
                Ok(()) => {
                    self.stats.record_admitted();
                    report.running += 1;
                    report.admitted.push(job.id);
                }
                Err(e) => {
                    self.fail_launch(&job, &e).await;
                    report.launch_failures.push(job.id);
                }
            }
        }

        Ok(Some(report))
    }

    async fn launch(&self, job: &Job) -> Result<(), BackendError> {
        timeout(self.backend_timeout, self.backend.launch(job))
            .await
            .map_err(|_| BackendError::Timeout(self.backend_timeout))?
    }

    async fn fail_launch(&self, job: &Job, error: &BackendError) {
        tracing::error!(job_id = %job.id, job = %job.name, error = %error, "failed to launch job");
        self.stats.record_launch_failure();

        if let Err(e) = self.lifecycle.stop(job, JobState::Fail).await {
            tracing::error!(job_id = %job.id, error = %e, "failed to mark job failed after launch failure");
        }
        self.lifecycle
            .events()
            .emit(Event::launch_failed(job.id, job.name.clone(), error.to_string()))
            .await;
    }

    /// Delete finished backend resources older than the configured age.
    ///
    /// Returns `Ok(None)` if a collection is already in flight.
    pub async fn collect_garbage(&self) -> Result<Option<usize>, SchedulerError> {
        let Some(_guard) = FlightGuard::acquire(&self.collecting) else {
            tracing::debug!("garbage collection still in flight, skipping");
            return Ok(None);
        };

        let deleted = timeout(
            self.backend_timeout,
            self.backend.garbage_collect(self.max_job_age_hours),
        )
        .await
        .map_err(|_| BackendError::Timeout(self.backend_timeout))??;

        self.stats.record_gc_deleted(deleted);
        if deleted > 0 {
            tracing::info!(deleted, max_age_hours = self.max_job_age_hours, "removed old cluster jobs");
        }
        Ok(Some(deleted))
    }

    /// Move a running job to a final state and release its locks.
    pub async fn stop_job(
        &self,
        job_id: &JobId,
        final_state: JobState,
    ) -> Result<OperationResult, SchedulerError> {
        if !final_state.is_stop_state() {
            return Err(SchedulerError::InvalidState(format!(
                "{} is not a final state",
                final_state
            )));
        }

        let job = self.lifecycle.jobs().get(job_id).await?;
        let stopped = self.lifecycle.stop(&job, final_state).await?;
        Ok(OperationResult::new(Operation::Stop, stopped))
    }

    /// Kill a job through the backend.
    pub async fn kill_job(&self, job_id: &JobId) -> Result<OperationResult, SchedulerError> {
        let job = self.lifecycle.jobs().get(job_id).await?;
        let killed = timeout(self.backend_timeout, self.backend.kill(&job))
            .await
            .map_err(|_| BackendError::Timeout(self.backend_timeout))??;
        Ok(OperationResult::new(Operation::Kill, killed))
    }

    /// Retry a job through the backend and wake the loop to re-admit it.
    pub async fn retry_job(&self, job_id: &JobId) -> Result<OperationResult, SchedulerError> {
        let job = self.lifecycle.jobs().get(job_id).await?;
        let retried = timeout(self.backend_timeout, self.backend.retry(&job))
            .await
            .map_err(|_| BackendError::Timeout(self.backend_timeout))??;
        if retried {
            self.wake.notify_one();
        }
        Ok(OperationResult::new(Operation::Retry, retried))
    }

    /// Stop admitting jobs. Returns whether the scheduler was running.
    pub async fn pause(&self) -> OperationResult {
        let changed = !self.paused.swap(true, Ordering::AcqRel);
        if changed {
            let mut state = self.state.write().await;
            if *state == SchedulerState::Running {
                *state = SchedulerState::Paused;
            }
            tracing::info!("scheduler paused");
        }
        OperationResult::new(Operation::Pause, changed)
    }

    /// Resume admitting jobs. Returns whether the scheduler was paused.
    pub async fn resume(&self) -> OperationResult {
        let changed = self.paused.swap(false, Ordering::AcqRel);
        if changed {
            let mut state = self.state.write().await;
            if *state == SchedulerState::Paused {
                *state = SchedulerState::Running;
            }
            self.wake.notify_one();
            tracing::info!("scheduler resumed");
        }
        OperationResult::new(Operation::Resume, changed)
    }
}
