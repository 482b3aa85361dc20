//! YAML configuration parsing.
//!
//! Parses the scheduler configuration and job submission files.

use std::path::Path;

use super::error::ConfigError;
use super::types::{BackendConfig, GlobalConfig, StorageConfig};
use crate::core::job::JobSpec;

/// Loader for YAML configuration files.
pub struct YamlLoader;

impl YamlLoader {
    /// Load global configuration from a file.
    pub fn load_global_config(path: impl AsRef<Path>) -> Result<GlobalConfig, ConfigError> {
        let path = path.as_ref();
        let content = read(path)?;
        let config: GlobalConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate_global_config(&config)?;
        Ok(config)
    }

    /// Parse global configuration from a YAML string.
    pub fn parse_global_config(yaml: &str) -> Result<GlobalConfig, ConfigError> {
        let config: GlobalConfig = serde_yaml::from_str(yaml)?;
        Self::validate_global_config(&config)?;
        Ok(config)
    }

    /// Load a job submission from a file.
    pub fn load_job_spec(path: impl AsRef<Path>) -> Result<JobSpec, ConfigError> {
        let path = path.as_ref();
        let content = read(path)?;
        let spec: JobSpec =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate_job_spec(&spec)?;
        Ok(spec)
    }

    /// Parse a job submission from a YAML string.
    pub fn parse_job_spec(yaml: &str) -> Result<JobSpec, ConfigError> {
        let spec: JobSpec = serde_yaml::from_str(yaml)?;
        Self::validate_job_spec(&spec)?;
        Ok(spec)
    }

    /// Validate a global configuration.
    fn validate_global_config(config: &GlobalConfig) -> Result<(), ConfigError> {
        if config.max_concurrent_jobs == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_concurrent_jobs must be greater than zero".into(),
            ));
        }

        if config.max_job_age_hours.is_nan() || config.max_job_age_hours <= 0.0 {
            return Err(ConfigError::InvalidConfig(
                "max_job_age_hours must be greater than zero".into(),
            ));
        }

        for (name, secs) in [
            ("tick_interval_secs", config.tick_interval_secs),
            ("gc_interval_secs", config.gc_interval_secs),
            ("backend_timeout_secs", config.backend_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if let StorageConfig::Sqlite { path } = &config.storage {
            if path.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "sqlite storage requires a path".into(),
                ));
            }
        }

        if let BackendConfig::Kubernetes(kube) = &config.backend {
            if kube.image.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "kubernetes backend requires an image".into(),
                ));
            }
            if kube.backoff_limit < 0 {
                return Err(ConfigError::InvalidConfig(
                    "backoff_limit cannot be negative".into(),
                ));
            }
            if kube.username.is_some() != kube.password.is_some() {
                return Err(ConfigError::InvalidConfig(
                    "username and password must be set together".into(),
                ));
            }
        }

        Ok(())
    }

    /// Validate a job submission.
    fn validate_job_spec(spec: &JobSpec) -> Result<(), ConfigError> {
        if spec.name.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("job name cannot be empty".into()));
        }
        if !spec.lock_assets && !spec.assets.is_empty() {
            tracing::warn!(job = %spec.name, "assets listed without lock_assets; they will not be locked");
        }
        Ok(())
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::KubernetesConfig;
    use crate::core::job::JobType;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = YamlLoader::parse_global_config("{}").unwrap();

        assert_eq!(config, GlobalConfig::default());
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.max_job_age_hours, 24.0);
        assert_eq!(config.tick_interval(), Duration::from_secs(10));
        assert_eq!(config.storage, StorageConfig::Memory);
        assert_eq!(config.backend, BackendConfig::Null);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
max_concurrent_jobs: 4
max_job_age_hours: 12.5
tick_interval_secs: 5
gc_interval_secs: 120
storage:
  type: sqlite
  path: /var/lib/jobwarden/jobs.db
backend:
  type: kubernetes
  url: https://10.0.0.1:6443
  namespace: ingest
  token: abc123
  image: registry.example.com/worker:2.0
  backoff_limit: 3
payload:
  dir: /srv/payloads
  base_url: https://payloads.example.com
"#;
        let config = YamlLoader::parse_global_config(yaml).unwrap();

        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.max_job_age_hours, 12.5);
        assert_eq!(config.gc_interval(), Duration::from_secs(120));
        assert_eq!(
            config.storage,
            StorageConfig::Sqlite {
                path: "/var/lib/jobwarden/jobs.db".into()
            }
        );
        match &config.backend {
            BackendConfig::Kubernetes(KubernetesConfig {
                url,
                namespace,
                image,
                backoff_limit,
                secret_name,
                ..
            }) => {
                assert_eq!(url, "https://10.0.0.1:6443");
                assert_eq!(namespace, "ingest");
                assert_eq!(image, "registry.example.com/worker:2.0");
                assert_eq!(*backoff_limit, 3);
                assert_eq!(secret_name, "jobwarden-secrets");
            }
            other => panic!("expected kubernetes backend, got {:?}", other),
        }
        assert_eq!(
            config.payload.base_url.as_deref(),
            Some("https://payloads.example.com")
        );
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let result = YamlLoader::parse_global_config("max_concurrent_jobs: 0");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_non_positive_job_age() {
        let result = YamlLoader::parse_global_config("max_job_age_hours: 0");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));

        let result = YamlLoader::parse_global_config("max_job_age_hours: .nan");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_kubernetes_without_image() {
        let yaml = "backend:\n  type: kubernetes\n  image: \"\"\n";
        let result = YamlLoader::parse_global_config(yaml);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_unknown_backend() {
        let result = YamlLoader::parse_global_config("backend:\n  type: nomad\n");
        assert!(matches!(result, Err(ConfigError::YamlError(_))));
    }

    #[test]
    fn test_load_missing_file_reports_path() {
        let result = YamlLoader::load_global_config("/nonexistent/jobwarden.yaml");
        match result {
            Err(ConfigError::FileReadError { path, .. }) => {
                assert_eq!(path, Path::new("/nonexistent/jobwarden.yaml"));
            }
            other => panic!("expected FileReadError, got {:?}", other),
        }
    }

    #[test]
    fn test_load_job_spec_from_file() {
        let organization = crate::core::types::OrganizationId::random();
        let asset = crate::core::types::AssetId::random();
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
name: nightly-export
organization_id: {organization}
job_type: Export
lock_assets: true
assets: ["{asset}"]
env:
  TARGET: s3://bucket/exports
payload:
  query: "type:image"
"#
        )
        .unwrap();

        let spec = YamlLoader::load_job_spec(file.path()).unwrap();

        assert_eq!(spec.name, "nightly-export");
        assert_eq!(spec.organization_id, organization);
        assert_eq!(spec.job_type, JobType::Export);
        assert_eq!(spec.assets, vec![asset]);
        assert_eq!(spec.env.get("TARGET").map(String::as_str), Some("s3://bucket/exports"));
        assert_eq!(spec.payload, Some(serde_json::json!({"query": "type:image"})));
    }

    #[test]
    fn test_job_spec_requires_name() {
        let yaml = format!(
            "name: \"  \"\norganization_id: {}\n",
            crate::core::types::OrganizationId::random()
        );
        let result = YamlLoader::parse_job_spec(&yaml);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }
}
