//! Asset locks.
//!
//! A lock binds one asset to the one job currently allowed to process it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{AssetId, JobId, LockId};

/// Request to lock an asset for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSpec {
    /// Asset being locked.
    pub asset_id: AssetId,
    /// Job taking the lock.
    pub job_id: JobId,
}

impl LockSpec {
    /// Create a new lock spec.
    pub fn new(asset_id: AssetId, job_id: JobId) -> Self {
        Self { asset_id, job_id }
    }
}

/// An exclusive claim on an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Lock identifier.
    pub id: LockId,
    /// Locked asset.
    pub asset_id: AssetId,
    /// Owning job.
    pub job_id: JobId,
    /// When the lock was taken.
    pub created_at: DateTime<Utc>,
}

impl Lock {
    /// Create a new lock record from a spec.
    pub fn from_spec(spec: LockSpec) -> Self {
        Self {
            id: LockId::new(),
            asset_id: spec.asset_id,
            job_id: spec.job_id,
            created_at: Utc::now(),
        }
    }
}
