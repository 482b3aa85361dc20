//! Kubernetes `batch/v1` Job manifests.

use serde_json::{Value, json};
use std::collections::BTreeMap;

use super::kubernetes::KubernetesSettings;
use crate::core::job::Job;

/// Label correlating a cluster resource with its job.
pub const JOB_ID_LABEL: &str = "jobId";

/// Label carrying the owning organization.
pub const ORGANIZATION_ID_LABEL: &str = "organizationId";

/// Label marking the workload type.
pub const TYPE_LABEL: &str = "type";

const WORKLOAD_TYPE: &str = "ingest";
const CONTAINER_NAME: &str = "job";

/// Build the manifest launching `job` with its payload at `payload_url`.
///
/// Fixed variables come first, followed by the job's own environment in key
/// order. A job variable never overrides a fixed one.
pub fn job_manifest(job: &Job, settings: &KubernetesSettings, payload_url: &str) -> Value {
    let labels = json!({
        JOB_ID_LABEL: job.id.to_string(),
        ORGANIZATION_ID_LABEL: job.organization_id.to_string(),
        TYPE_LABEL: WORKLOAD_TYPE,
    });

    let mut fixed = BTreeMap::new();
    fixed.insert("JOB_ID", job.id.to_string());
    fixed.insert("ORGANIZATION_ID", job.organization_id.to_string());
    fixed.insert(
        "GOOGLE_APPLICATION_CREDENTIALS",
        format!(
            "{}/credentials.json",
            settings.secret_mount_path.trim_end_matches('/')
        ),
    );

    let mut env: Vec<Value> = fixed
        .iter()
        .map(|(name, value)| json!({"name": name, "value": value}))
        .collect();
    let extra: BTreeMap<_, _> = job
        .env
        .iter()
        .filter(|(name, _)| !fixed.contains_key(name.as_str()))
        .collect();
    env.extend(
        extra
            .into_iter()
            .map(|(name, value)| json!({"name": name, "value": value})),
    );

    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": job.name,
            "labels": labels,
        },
        "spec": {
            "backoffLimit": settings.backoff_limit,
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": CONTAINER_NAME,
                        "image": settings.image,
                        "args": [payload_url],
                        "env": env,
                        "volumeMounts": [{
                            "name": settings.secret_name,
                            "mountPath": settings.secret_mount_path,
                            "readOnly": true,
                        }],
                    }],
                    "volumes": [{
                        "name": settings.secret_name,
                        "secret": { "secretName": settings.secret_name },
                    }],
                },
            },
        },
    })
}
