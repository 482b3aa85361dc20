//! Payload staging.
//!
//! A job's payload is written before the job becomes schedulable; the
//! container receives a URL to it as its single argument.

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;

use super::BackendError;
use crate::core::job::Job;

/// Stores job payloads and hands out URLs to them.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Write the payload for a job.
    async fn stage(&self, job: &Job, payload: &Value) -> Result<(), BackendError>;

    /// URL the execution container fetches the payload from.
    async fn signed_url(&self, job: &Job) -> Result<String, BackendError>;
}

/// Payload store backed by a local directory.
///
/// Payloads land at `<dir>/<organization>/<job>/payload.json`. URLs are
/// `<base_url>/<organization>/<job>/payload.json` when a base URL is
/// configured (for a directory served over HTTP or mounted into the cluster),
/// `file://` URLs otherwise.
#[derive(Debug, Clone)]
pub struct FilePayloadStore {
    dir: PathBuf,
    base_url: Option<String>,
}

impl FilePayloadStore {
    /// Create a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            base_url: None,
        }
    }

    /// Serve payloads from `base_url` instead of `file://` URLs.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    fn path_for(&self, job: &Job) -> PathBuf {
        self.dir.join(job.payload_path())
    }
}

#[async_trait]
impl PayloadStore for FilePayloadStore {
    async fn stage(&self, job: &Job, payload: &Value) -> Result<(), BackendError> {
        let path = self.path_for(job);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BackendError::Payload(format!("{}: {}", parent.display(), e)))?;
        }

        let bytes =
            serde_json::to_vec_pretty(payload).map_err(|e| BackendError::Payload(e.to_string()))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| BackendError::Payload(format!("{}: {}", path.display(), e)))?;

        tracing::debug!(job_id = %job.id, path = %path.display(), "staged payload");
        Ok(())
    }

    async fn signed_url(&self, job: &Job) -> Result<String, BackendError> {
        match &self.base_url {
            Some(base) => Ok(format!("{}/{}", base, job.payload_path())),
            None => Ok(format!("file://{}", self.path_for(job).display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobSpec;
    use crate::core::types::OrganizationId;
    use tempfile::TempDir;

    fn job() -> Job {
        Job::from_spec(&JobSpec::new("payload-job", OrganizationId::random()))
    }

    #[tokio::test]
    async fn test_stage_writes_payload_under_job_path() {
        let dir = TempDir::new().unwrap();
        let store = FilePayloadStore::new(dir.path());
        let job = job();
        let payload = serde_json::json!({"files": ["a.jpg", "b.jpg"]});

        store.stage(&job, &payload).await.unwrap();

        let written = tokio::fs::read(dir.path().join(job.payload_path()))
            .await
            .unwrap();
        let parsed: Value = serde_json::from_slice(&written).unwrap();
        assert_eq!(parsed, payload);
    }

    #[tokio::test]
    async fn test_signed_url_uses_base_url() {
        let store = FilePayloadStore::new("/data").with_base_url("https://payloads.example.com/");
        let job = job();

        let url = store.signed_url(&job).await.unwrap();

        assert_eq!(
            url,
            format!("https://payloads.example.com/{}", job.payload_path())
        );
    }

    #[tokio::test]
    async fn test_signed_url_defaults_to_file_url() {
        let store = FilePayloadStore::new("/data");
        let url = store.signed_url(&job()).await.unwrap();

        assert!(url.starts_with("file:///data/"));
        assert!(url.ends_with("/payload.json"));
    }
}
