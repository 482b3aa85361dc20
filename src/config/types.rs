//! Configuration type definitions.
//!
//! This module contains the structures of the scheduler configuration file
//! (`jobwarden.yaml`): admission limits, intervals, storage, backend and
//! payload staging.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration (jobwarden.yaml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Maximum number of jobs running at once.
    pub max_concurrent_jobs: usize,
    /// Age after which finished cluster resources are deleted.
    pub max_job_age_hours: f64,
    /// Seconds between scheduler ticks.
    pub tick_interval_secs: u64,
    /// Seconds between garbage collection passes.
    pub gc_interval_secs: u64,
    /// Bound on every backend call, in seconds.
    pub backend_timeout_secs: u64,
    /// Seconds to wait for in-flight work on shutdown.
    pub shutdown_timeout_secs: u64,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Orchestration backend configuration.
    pub backend: BackendConfig,
    /// Payload staging configuration.
    pub payload: PayloadConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            max_job_age_hours: 24.0,
            tick_interval_secs: 10,
            gc_interval_secs: 60,
            backend_timeout_secs: 30,
            shutdown_timeout_secs: 30,
            storage: StorageConfig::default(),
            backend: BackendConfig::default(),
            payload: PayloadConfig::default(),
        }
    }
}

impl GlobalConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Orchestration backend configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BackendConfig {
    /// No cluster; launches are no-ops.
    #[serde(rename = "null")]
    #[default]
    Null,
    /// Kubernetes batch API.
    #[serde(rename = "kubernetes")]
    Kubernetes(KubernetesConfig),
}

/// Kubernetes connection and launch settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// API server URL.
    #[serde(default = "default_kubernetes_url")]
    pub url: String,
    /// Namespace jobs are launched in.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Bearer token.
    pub token: Option<String>,
    /// Basic auth user name.
    pub username: Option<String>,
    /// Basic auth password.
    pub password: Option<String>,
    /// Path to the PEM-encoded cluster CA certificate.
    pub ca_cert: Option<PathBuf>,
    /// Container image.
    pub image: String,
    /// Secret mounted into the container.
    #[serde(default = "default_secret_name")]
    pub secret_name: String,
    /// Where the secret is mounted.
    #[serde(default = "default_secret_mount_path")]
    pub secret_mount_path: String,
    /// Pod retries before the cluster marks the Job failed.
    #[serde(default = "default_backoff_limit")]
    pub backoff_limit: i32,
}

fn default_kubernetes_url() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_secret_name() -> String {
    "jobwarden-secrets".to_string()
}

fn default_secret_mount_path() -> String {
    "/var/secrets/google".to_string()
}

fn default_backoff_limit() -> i32 {
    1
}

/// Payload staging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    /// Directory payloads are written to.
    pub dir: PathBuf,
    /// URL the directory is served under, if any.
    pub base_url: Option<String>,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("payloads"),
            base_url: None,
        }
    }
}
