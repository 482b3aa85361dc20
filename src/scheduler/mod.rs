//! Scheduler engine for job admission and reconciliation.
//!
//! This module provides the control loop that reconciles running jobs with
//! the orchestration backend, admits waiting jobs under the concurrency
//! ceiling and asset locks, and garbage collects finished backend resources.

mod engine;
mod handle;
mod types;

pub use engine::Scheduler;
pub use handle::SchedulerHandle;
pub use types::{
    Operation, OperationResult, SchedulerError, SchedulerState, SchedulerStats, StatsSnapshot,
    TickReport,
};
