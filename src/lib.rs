pub mod backend;
pub mod config;
pub mod core;
pub mod events;
pub mod lifecycle;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use backend::{
    BackendError, ExecutionStatus, FilePayloadStore, KubernetesBackend, KubernetesClient,
    KubernetesSettings, NullBackend, OrchestrationBackend, OrchestrationClient, PayloadStore,
    ReconcileReport,
};
pub use config::{
    BackendConfig, ConfigError, GlobalConfig, KubernetesConfig, PayloadConfig, StorageConfig,
    YamlLoader,
};
pub use core::job::{Job, JobSpec, JobState, JobType};
pub use core::lock::{Lock, LockSpec};
pub use core::types::{AssetId, JobId, LockId, OrganizationId};
pub use events::{Event, EventBus, EventHandler, LoggingHandler};
pub use lifecycle::JobLifecycle;
pub use scheduler::{
    Operation, OperationResult, Scheduler, SchedulerError, SchedulerHandle, SchedulerState,
    StatsSnapshot, TickReport,
};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use storage::{InMemoryStorage, JobFilter, JobStore, LockStore, StorageError};
