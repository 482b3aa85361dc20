//! Job entity, submission spec and the job state machine.
//!
//! A job moves through `Setup -> Waiting -> Running` and ends in one of the
//! stop states `Success`, `Fail` or `Orphan`. A retry moves it back to
//! `Waiting`; a kill forces it to `Fail` from any state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::types::{AssetId, JobId, OrganizationId};

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Created, payload not yet staged. Never dispatched.
    Setup,
    /// Ready to be admitted by the scheduler.
    Waiting,
    /// Admitted and launched on the backend.
    Running,
    /// Backend reported completion.
    Success,
    /// Launch failure, backend failure or kill.
    Fail,
    /// The store believed the job was running but the backend had no record of it.
    Orphan,
}

impl JobState {
    /// All states, in code order.
    pub const ALL: [JobState; 6] = [
        JobState::Setup,
        JobState::Waiting,
        JobState::Running,
        JobState::Success,
        JobState::Fail,
        JobState::Orphan,
    ];

    /// Integer code used by persistent stores.
    pub fn code(self) -> i64 {
        match self {
            JobState::Setup => 0,
            JobState::Waiting => 1,
            JobState::Running => 2,
            JobState::Success => 3,
            JobState::Fail => 4,
            JobState::Orphan => 5,
        }
    }

    /// Decode a persisted state code.
    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Entering this state stamps `started_at`.
    pub fn is_start_state(self) -> bool {
        matches!(self, JobState::Running)
    }

    /// Entering this state stamps `stopped_at`.
    pub fn is_stop_state(self) -> bool {
        matches!(self, JobState::Success | JobState::Fail | JobState::Orphan)
    }

    /// Whether the job is no longer scheduled or executing.
    pub fn is_terminal(self) -> bool {
        self.is_stop_state()
    }

    /// Lowercase name used in logs and the CLI.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Setup => "setup",
            JobState::Waiting => "waiting",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Fail => "fail",
            JobState::Orphan => "orphan",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job state: {}", s))
    }
}

/// Kind of processing a job performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    /// Imports new assets.
    #[default]
    Import,
    /// Exports existing assets.
    Export,
    /// Generic batch processing over existing assets.
    Batch,
}

impl JobType {
    /// Integer code used by persistent stores.
    pub fn code(self) -> i64 {
        match self {
            JobType::Import => 0,
            JobType::Export => 1,
            JobType::Batch => 2,
        }
    }

    /// Decode a persisted type code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(JobType::Import),
            1 => Some(JobType::Export),
            2 => Some(JobType::Batch),
            _ => None,
        }
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Import => "import",
            JobType::Export => "export",
            JobType::Batch => "batch",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "import" => Ok(JobType::Import),
            "export" => Ok(JobType::Export),
            "batch" => Ok(JobType::Batch),
            other => Err(format!("unknown job type: {}", other)),
        }
    }
}

/// A submission request for a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Globally unique job name.
    pub name: String,
    /// Owning organization.
    pub organization_id: OrganizationId,
    /// Processing type.
    #[serde(default)]
    pub job_type: JobType,
    /// Whether the job takes exclusive locks on its assets when admitted.
    #[serde(default)]
    pub lock_assets: bool,
    /// Open attributes.
    #[serde(default)]
    pub attrs: HashMap<String, Value>,
    /// Environment passed to the execution container.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Assets the job intends to touch.
    #[serde(default)]
    pub assets: Vec<AssetId>,
    /// Payload staged for the container before the job becomes schedulable.
    #[serde(default)]
    pub payload: Option<Value>,
}

impl JobSpec {
    /// Create a spec with the given name and organization.
    pub fn new(name: impl Into<String>, organization_id: OrganizationId) -> Self {
        Self {
            name: name.into(),
            organization_id,
            job_type: JobType::default(),
            lock_assets: false,
            attrs: HashMap::new(),
            env: HashMap::new(),
            assets: Vec::new(),
            payload: None,
        }
    }

    /// Set the job type.
    pub fn with_type(mut self, job_type: JobType) -> Self {
        self.job_type = job_type;
        self
    }

    /// Lock the given assets while the job runs.
    pub fn with_locked_assets(mut self, assets: impl IntoIterator<Item = AssetId>) -> Self {
        self.lock_assets = true;
        self.assets.extend(assets);
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add an attribute.
    pub fn with_attr(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A stored job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique, time-ordered identifier.
    pub id: JobId,
    /// Owning organization.
    pub organization_id: OrganizationId,
    /// Unique name.
    pub name: String,
    /// Processing type.
    pub job_type: JobType,
    /// Current state.
    pub state: JobState,
    /// Whether the job participates in asset locking.
    pub lock_assets: bool,
    /// Open attributes.
    pub attrs: HashMap<String, Value>,
    /// Environment passed to the execution container.
    pub env: HashMap<String, String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last modified.
    pub modified_at: DateTime<Utc>,
    /// When the job last entered `Running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job last entered a stop state.
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a fresh `Setup` job from a spec.
    pub fn from_spec(spec: &JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            organization_id: spec.organization_id,
            name: spec.name.clone(),
            job_type: spec.job_type,
            state: JobState::Setup,
            lock_assets: spec.lock_assets,
            attrs: spec.attrs.clone(),
            env: spec.env.clone(),
            created_at: now,
            modified_at: now,
            started_at: None,
            stopped_at: None,
        }
    }

    /// Apply a successful state change to this record, stamping timestamps.
    pub fn apply_state(&mut self, new_state: JobState, now: DateTime<Utc>) {
        self.state = new_state;
        self.modified_at = now;
        if new_state.is_start_state() {
            self.started_at = Some(now);
            self.stopped_at = None;
        } else if new_state.is_stop_state() {
            self.stopped_at = Some(now);
        }
    }

    /// Object path of the staged payload, relative to the payload store root.
    pub fn payload_path(&self) -> String {
        format!("{}/{}/payload.json", self.organization_id, self.id)
    }
}
