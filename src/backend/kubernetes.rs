//! Kubernetes backend.
//!
//! [`KubernetesClient`] speaks the `batch/v1` REST API of a cluster over
//! `reqwest`. [`KubernetesBackend`] implements the job contracts on top of any
//! [`OrchestrationClient`], correlating cluster Jobs with stored jobs through
//! the `jobId` label.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

use super::manifest::{self, JOB_ID_LABEL};
use super::payload::PayloadStore;
use super::{
    BackendError, ExecutionResource, ExecutionStatus, OrchestrationBackend, OrchestrationClient,
    ReconcileReport,
};
use crate::core::job::{Job, JobState};
use crate::events::Event;
use crate::lifecycle::JobLifecycle;

/// Settings shaping the launched cluster Jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubernetesSettings {
    /// Container image.
    pub image: String,
    /// Secret mounted into the container.
    pub secret_name: String,
    /// Where the secret is mounted.
    pub secret_mount_path: String,
    /// Pod retries before the cluster marks the Job failed.
    pub backoff_limit: i32,
}

impl KubernetesSettings {
    /// Settings for `image` with the default secret and backoff.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            secret_name: "jobwarden-secrets".to_string(),
            secret_mount_path: "/var/secrets/google".to_string(),
            backoff_limit: 1,
        }
    }
}

#[derive(Debug, Clone)]
enum Credentials {
    None,
    Bearer(String),
    Basic { username: String, password: String },
}

/// REST client for the Kubernetes batch API, scoped to one namespace.
#[derive(Debug, Clone)]
pub struct KubernetesClient {
    http: reqwest::Client,
    base_url: String,
    namespace: String,
    credentials: Credentials,
}

impl KubernetesClient {
    /// Create a client for the API server at `url`.
    pub fn new(url: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: url.into().trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            credentials: Credentials::None,
        }
    }

    /// Authenticate with a bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.credentials = Credentials::Bearer(token.into());
        self
    }

    /// Authenticate with basic auth.
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Credentials::Basic {
            username: username.into(),
            password: password.into(),
        };
        self
    }

    /// Trust the PEM-encoded cluster CA certificate.
    pub fn with_ca_cert(mut self, pem: &[u8]) -> Result<Self, BackendError> {
        let cert = reqwest::Certificate::from_pem(pem)
            .map_err(|e| BackendError::Transport(format!("invalid CA certificate: {}", e)))?;
        self.http = reqwest::Client::builder()
            .add_root_certificate(cert)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(self)
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            self.base_url, self.namespace
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Credentials::None => request,
            Credentials::Bearer(token) => request.bearer_auth(token),
            Credentials::Basic { username, password } => request.basic_auth(username, Some(password)),
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, BackendError> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))
    }

    async fn list(&self, selector: &str) -> Result<Vec<ExecutionResource>, BackendError> {
        let response = self
            .send(
                self.http
                    .get(self.jobs_url())
                    .query(&[("labelSelector", selector)]),
            )
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(body["items"]
            .as_array()
            .map(|items| items.iter().filter_map(parse_resource).collect())
            .unwrap_or_default())
    }
}

async fn api_error(response: reqwest::Response) -> BackendError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    BackendError::Api { status, message }
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Read an [`ExecutionStatus`] from a Job's `status` object.
pub(crate) fn parse_status(status: &Value) -> ExecutionStatus {
    if status["succeeded"].as_i64().unwrap_or(0) >= 1 {
        return ExecutionStatus::Succeeded {
            completed_at: parse_time(&status["completionTime"]),
        };
    }

    let failed = status["conditions"].as_array().and_then(|conditions| {
        conditions
            .iter()
            .find(|c| c["type"] == "Failed" && c["status"] == "True")
    });
    if let Some(condition) = failed {
        return ExecutionStatus::Failed {
            failed_at: parse_time(&condition["lastTransitionTime"]),
        };
    }

    if status["active"].as_i64().unwrap_or(0) >= 1 {
        ExecutionStatus::Active
    } else {
        ExecutionStatus::Pending
    }
}

/// Read an [`ExecutionResource`] from a Job object. `None` without a name.
pub(crate) fn parse_resource(item: &Value) -> Option<ExecutionResource> {
    let metadata = &item["metadata"];
    Some(ExecutionResource {
        name: metadata["name"].as_str()?.to_string(),
        job_id: metadata["labels"][JOB_ID_LABEL]
            .as_str()
            .and_then(|id| id.parse().ok()),
        status: parse_status(&item["status"]),
    })
}

#[async_trait]
impl OrchestrationClient for KubernetesClient {
    async fn submit(&self, manifest: &Value) -> Result<(), BackendError> {
        let response = self.send(self.http.post(self.jobs_url()).json(manifest)).await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), BackendError> {
        let url = format!("{}/{}", self.jobs_url(), name);
        let response = self
            .send(
                self.http
                    .delete(url)
                    .query(&[("propagationPolicy", "Background")]),
            )
            .await?;
        match response.status() {
            s if s.is_success() || s == reqwest::StatusCode::NOT_FOUND => Ok(()),
            _ => Err(api_error(response).await),
        }
    }

    async fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<String>, BackendError> {
        let selector = format!("{}={}", key, value);
        Ok(self
            .list(&selector)
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect())
    }

    async fn get_status(&self, name: &str) -> Result<Option<ExecutionStatus>, BackendError> {
        let url = format!("{}/{}", self.jobs_url(), name);
        let response = self.send(self.http.get(url)).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Some(parse_status(&body["status"])))
    }

    async fn list_managed(&self) -> Result<Vec<ExecutionResource>, BackendError> {
        self.list(JOB_ID_LABEL).await
    }
}

/// Backend running jobs as Kubernetes `batch/v1` Jobs.
pub struct KubernetesBackend {
    client: Arc<dyn OrchestrationClient>,
    lifecycle: Arc<JobLifecycle>,
    payloads: Arc<dyn PayloadStore>,
    settings: KubernetesSettings,
}

impl KubernetesBackend {
    /// Create a backend over a cluster client.
    pub fn new(
        client: Arc<dyn OrchestrationClient>,
        lifecycle: Arc<JobLifecycle>,
        payloads: Arc<dyn PayloadStore>,
        settings: KubernetesSettings,
    ) -> Self {
        Self {
            client,
            lifecycle,
            payloads,
            settings,
        }
    }

    /// Delete every cluster resource labeled with the job's id.
    async fn delete_resources(&self, job: &Job) -> Result<usize, BackendError> {
        let names = self
            .client
            .list_by_label(JOB_ID_LABEL, &job.id.to_string())
            .await?;
        for name in &names {
            self.client.delete(name).await?;
            tracing::debug!(job_id = %job.id, resource = %name, "deleted cluster job");
        }
        Ok(names.len())
    }

    async fn reconcile_job(&self, job: &Job, report: &mut ReconcileReport) -> Result<(), BackendError> {
        let names = self
            .client
            .list_by_label(JOB_ID_LABEL, &job.id.to_string())
            .await?;

        let Some(name) = names.first() else {
            if self.lifecycle.stop(job, JobState::Orphan).await? {
                tracing::warn!(job_id = %job.id, job = %job.name, "running job has no cluster resource, marked orphan");
                self.lifecycle
                    .events()
                    .emit(Event::orphaned(job.id, job.name.clone()))
                    .await;
                report.orphaned.push(job.id);
            }
            return Ok(());
        };
        if names.len() > 1 {
            tracing::warn!(job_id = %job.id, count = names.len(), "multiple cluster resources for job");
        }

        match self.client.get_status(name).await? {
            Some(ExecutionStatus::Succeeded { .. }) => {
                if self.lifecycle.stop(job, JobState::Success).await? {
                    report.succeeded += 1;
                }
            }
            Some(ExecutionStatus::Failed { .. }) => {
                if self.lifecycle.stop(job, JobState::Fail).await? {
                    report.failed += 1;
                }
            }
            Some(ExecutionStatus::Active) => report.still_running += 1,
            Some(ExecutionStatus::Pending) | None => {
                tracing::info!(job_id = %job.id, resource = %name, "cluster job has no status yet");
                report.still_running += 1;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl OrchestrationBackend for KubernetesBackend {
    async fn launch(&self, job: &Job) -> Result<(), BackendError> {
        let payload_url = self.payloads.signed_url(job).await?;
        let manifest = manifest::job_manifest(job, &self.settings, &payload_url);
        self.client.submit(&manifest).await?;
        tracing::info!(job_id = %job.id, job = %job.name, image = %self.settings.image, "launched cluster job");
        Ok(())
    }

    async fn kill(&self, job: &Job) -> Result<bool, BackendError> {
        let deleted = self.delete_resources(job).await?;

        let changed = if job.state == JobState::Running {
            self.lifecycle.stop(job, JobState::Fail).await?
        } else {
            let changed = self.lifecycle.force_state(job, JobState::Fail).await?;
            if changed {
                self.lifecycle.clear_locks(job).await?;
            }
            changed
        };

        tracing::info!(job_id = %job.id, deleted, changed, "killed job");
        Ok(changed)
    }

    async fn retry(&self, job: &Job) -> Result<bool, BackendError> {
        let deleted = self.delete_resources(job).await?;

        let changed = if job.state == JobState::Running {
            self.lifecycle.stop(job, JobState::Waiting).await?
        } else {
            self.lifecycle.force_state(job, JobState::Waiting).await?
        };
        self.lifecycle.clear_locks(job).await?;

        tracing::info!(job_id = %job.id, deleted, changed, "retrying job");
        Ok(changed)
    }

    async fn reconcile(&self, running: &[Job]) -> Result<ReconcileReport, BackendError> {
        let mut report = ReconcileReport::default();

        for job in running {
            report.checked += 1;
            if let Err(e) = self.reconcile_job(job, &mut report).await {
                tracing::warn!(job_id = %job.id, error = %e, "failed to reconcile job");
                report.errors += 1;
            }
        }

        if !report.orphaned.is_empty() {
            tracing::warn!(count = report.orphaned.len(), "orphaned jobs detected");
        }
        Ok(report)
    }

    async fn garbage_collect(&self, max_age_hours: f64) -> Result<usize, BackendError> {
        let now = Utc::now();
        let mut deleted = 0;

        for resource in self.client.list_managed().await? {
            let Some(finished_at) = resource.status.finished_at() else {
                continue;
            };
            let age_hours = (now - finished_at).num_milliseconds() as f64 / 3_600_000.0;
            if age_hours <= max_age_hours {
                continue;
            }

            match self.client.delete(&resource.name).await {
                Ok(()) => {
                    deleted += 1;
                    tracing::debug!(resource = %resource.name, age_hours, "removed finished cluster job");
                }
                Err(e) => {
                    tracing::warn!(resource = %resource.name, error = %e, "failed to remove cluster job");
                }
            }
        }

        Ok(deleted)
    }
}
