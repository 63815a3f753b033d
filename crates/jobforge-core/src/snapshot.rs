//! Workspace snapshot contract.
//!
//! Snapshots are produced by an external state manager; the orchestrator only
//! requests them after a successful job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sandbox::Sandbox;
use crate::{JobId, Result};

/// An archived copy of a job's workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSnapshot {
    pub job_id: JobId,
    pub commit: String,
    pub timestamp: DateTime<Utc>,
    /// Blob path of the archive.
    pub location: String,
    pub size: u64,
}

/// Creates workspace snapshots.
#[async_trait]
pub trait StateManager: Send + Sync {
    async fn create_snapshot(
        &self,
        sandbox: &dyn Sandbox,
        job_id: &JobId,
        commit: &str,
        paths: &[String],
    ) -> Result<WorkspaceSnapshot>;
}
