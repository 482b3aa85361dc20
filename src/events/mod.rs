//! Job lifecycle events and event handling.
//!
//! State changes performed through [`JobLifecycle`](crate::lifecycle::JobLifecycle)
//! and orphan detections made during reconciliation are published here, so
//! observers can follow jobs without polling the store.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::core::job::JobState;
use crate::core::types::JobId;

/// Lifecycle events emitted by the scheduler.
#[derive(Debug, Clone)]
pub enum Event {
    /// A job changed state.
    JobStateChanged {
        job_id: JobId,
        name: String,
        /// State the job was in before the change, if known.
        old_state: Option<JobState>,
        new_state: JobState,
        timestamp: Instant,
    },

    /// A job the store believed to be running had no backend resource.
    JobOrphaned {
        job_id: JobId,
        name: String,
        timestamp: Instant,
    },

    /// Launching a job on the backend failed.
    JobLaunchFailed {
        job_id: JobId,
        name: String,
        error: String,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::JobStateChanged { timestamp, .. } => *timestamp,
            Event::JobOrphaned { timestamp, .. } => *timestamp,
            Event::JobLaunchFailed { timestamp, .. } => *timestamp,
        }
    }

    /// Job the event concerns.
    pub fn job_id(&self) -> JobId {
        match self {
            Event::JobStateChanged { job_id, .. } => *job_id,
            Event::JobOrphaned { job_id, .. } => *job_id,
            Event::JobLaunchFailed { job_id, .. } => *job_id,
        }
    }

    /// Create a JobStateChanged event.
    pub fn state_changed(
        job_id: JobId,
        name: impl Into<String>,
        old_state: Option<JobState>,
        new_state: JobState,
    ) -> Self {
        Event::JobStateChanged {
            job_id,
            name: name.into(),
            old_state,
            new_state,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobOrphaned event.
    pub fn orphaned(job_id: JobId, name: impl Into<String>) -> Self {
        Event::JobOrphaned {
            job_id,
            name: name.into(),
            timestamp: Instant::now(),
        }
    }

    /// Create a JobLaunchFailed event.
    pub fn launch_failed(job_id: JobId, name: impl Into<String>, error: impl Into<String>) -> Self {
        Event::JobLaunchFailed {
            job_id,
            name: name.into(),
            error: error.into(),
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Emit an event to all registered handlers, in registration order.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler that logs every event through `tracing`.
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::JobStateChanged {
                job_id,
                name,
                old_state,
                new_state,
                ..
            } => {
                let old = old_state.map(JobState::as_str).unwrap_or("unknown");
                tracing::info!(job_id = %job_id, job = %name, from = old, to = %new_state, "job state changed");
            }
            Event::JobOrphaned { job_id, name, .. } => {
                tracing::warn!(job_id = %job_id, job = %name, "job orphaned");
            }
            Event::JobLaunchFailed {
                job_id, name, error, ..
            } => {
                tracing::error!(job_id = %job_id, job = %name, error = %error, "job launch failed");
            }
        }
    }
}
