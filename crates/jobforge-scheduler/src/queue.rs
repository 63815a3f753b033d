//! Priority job queue on top of the metadata store.
//!
//! Pending jobs are `queue:{priority}:{timestamp}:{jobId}` entries. Claiming
//! is serialized by an in-process lock, so one queue instance is the single
//! dispatch authority for its store. Several processes sharing a store are
//! still subject to the store's eventual consistency.

use chrono::Utc;
use jobforge_core::keys::{QUEUE_PREFIX, QueueKey, STATUS_PREFIX, job_key, status_key};
use jobforge_core::{
    Error, Job, JobId, JobState, JobStatus, MetadataStore, MetadataStoreExt, Result,
};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Queue limits.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Ceiling on simultaneously running jobs.
    pub max_concurrent: usize,
    /// Retention of pending queue entries.
    pub entry_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            entry_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Job queue backed by a [`MetadataStore`].
pub struct JobQueue {
    store: Arc<dyn MetadataStore>,
    config: QueueConfig,
    claim_lock: tokio::sync::Mutex<()>,
    last_timestamp: parking_lot::Mutex<i64>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn MetadataStore>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            claim_lock: tokio::sync::Mutex::new(()),
            last_timestamp: parking_lot::Mutex::new(0),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Milliseconds since the epoch, strictly increasing per instance.
    fn next_timestamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_timestamp.lock();
        let ts = now.max(*last + 1);
        *last = ts;
        ts
    }

    /// Enqueue a new job.
    ///
    /// Rejects invalid jobs and jobs whose id is still queued or running.
    pub async fn enqueue(&self, job: &Job) -> Result<()> {
        job.validate()?;
        if let Some(existing) = self.get_job_status(&job.id).await? {
            if !existing.is_terminal() {
                return Err(Error::Validation(format!(
                    "job '{}' is already {}",
                    job.id, existing.status
                )));
            }
        }

        let entry = QueueKey::new(job.priority, self.next_timestamp(), job.id.clone());

        self.store.put_json(&job_key(&job.id), job, None).await?;
        self.store
            .put_json(&status_key(&job.id), &JobStatus::queued(job), None)
            .await?;
        self.store
            .put(
                &entry.to_string(),
                serde_json::Value::String(job.id.to_string()),
                Some(self.config.entry_ttl),
            )
            .await?;

        info!(job_id = %job.id, priority = job.priority, "Enqueued job");
        Ok(())
    }

    /// Claim the next job, or `None` when the queue is empty or the
    /// concurrency ceiling is reached.
    ///
    /// The claimed job's status is `running` when this returns.
    pub async fn dequeue(&self) -> Result<Option<Job>> {
        let _claim = self.claim_lock.lock().await;

        let running = self.list_jobs(Some(JobState::Running)).await?.len();
        if running >= self.config.max_concurrent {
            debug!(running, max = self.config.max_concurrent, "At capacity");
            return Ok(None);
        }

        let mut pending = BinaryHeap::new();
        for raw in self.store.list(QUEUE_PREFIX).await? {
            match raw.parse::<QueueKey>() {
                Ok(key) => pending.push((key, raw)),
                Err(e) => warn!(key = %raw, error = %e, "Ignoring malformed queue entry"),
            }
        }

        while let Some((entry, raw)) = pending.pop() {
            let status = self.get_job_status(&entry.job_id).await?;
            let Some(mut status) = status.filter(|s| s.status == JobState::Queued) else {
                debug!(job_id = %entry.job_id, "Discarding stale queue entry");
                self.store.delete(&raw).await?;
                continue;
            };
            let Some(job) = self.get_job(&entry.job_id).await? else {
                warn!(job_id = %entry.job_id, "Queued job has no stored definition");
                self.store.delete(&raw).await?;
                continue;
            };

            self.store.delete(&raw).await?;
            status.mark_running();
            self.update_job_status(&job.id, &status).await?;

            info!(job_id = %job.id, priority = entry.priority, "Claimed job");
            return Ok(Some(job));
        }

        Ok(None)
    }

    pub async fn get_job_status(&self, job_id: &JobId) -> Result<Option<JobStatus>> {
        self.store.get_json(&status_key(job_id)).await
    }

    /// Replace the stored status. Last write wins.
    pub async fn update_job_status(&self, job_id: &JobId, status: &JobStatus) -> Result<()> {
        self.store.put_json(&status_key(job_id), status, None).await
    }

    /// The job definition retained at submission.
    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        self.store.get_json(&job_key(job_id)).await
    }

    /// All status records, oldest submission first.
    pub async fn list_jobs(&self, filter: Option<JobState>) -> Result<Vec<JobStatus>> {
        let mut jobs = Vec::new();
        for key in self.store.list(STATUS_PREFIX).await? {
            // Records can disappear between list and get.
            let Some(status) = self.store.get_json::<JobStatus>(&key).await? else {
                continue;
            };
            if filter.is_none_or(|state| status.status == state) {
                jobs.push(status);
            }
        }
        jobs.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
        Ok(jobs)
    }

    /// Cancel a queued or running job.
    ///
    /// Returns `false` for unknown or already finished jobs. Running jobs only
    /// have their status changed here; stopping the work is up to the caller.
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<bool> {
        let Some(mut status) = self.get_job_status(job_id).await? else {
            return Ok(false);
        };
        if status.is_terminal() {
            return Ok(false);
        }

        if status.status == JobState::Queued {
            for raw in self.store.list(QUEUE_PREFIX).await? {
                if QueueKey::key_matches_job(&raw, job_id) {
                    self.store.delete(&raw).await?;
                }
            }
        }

        status.finish(JobState::Cancelled, None);
        self.update_job_status(job_id, &status).await?;
        info!(job_id = %job_id, "Cancelled job");
        Ok(true)
    }

    /// Re-enqueue a failed job from its retained definition.
    pub async fn retry_job(&self, job_id: &JobId) -> Result<bool> {
        let Some(status) = self.get_job_status(job_id).await? else {
            return Ok(false);
        };
        if status.status != JobState::Failure {
            return Ok(false);
        }
        let Some(job) = self.get_job(job_id).await? else {
            warn!(job_id = %job_id, "Cannot retry, job definition is gone");
            return Ok(false);
        };

        self.enqueue(&job).await?;
        info!(job_id = %job_id, "Retrying job");
        Ok(true)
    }

    /// Delete finished records older than `max_age`.
    ///
    /// `timeout` records are kept.
    pub async fn prune_completed_jobs(&self, max_age: Duration) -> Result<usize> {
        let max_age =
            chrono::TimeDelta::from_std(max_age).map_err(|e| Error::Validation(e.to_string()))?;
        let cutoff = Utc::now() - max_age;

        let mut pruned = 0;
        for status in self.list_jobs(None).await? {
            let prunable = matches!(
                status.status,
                JobState::Success | JobState::Failure | JobState::Cancelled
            );
            let old = status.finished_at.is_some_and(|at| at < cutoff);
            if prunable && old {
                self.store.delete(&status_key(&status.job_id)).await?;
                self.store.delete(&job_key(&status.job_id)).await?;
                pruned += 1;
            }
        }

        if pruned > 0 {
            info!(count = pruned, "Pruned completed jobs");
        }
        Ok(pruned)
    }

    /// Number of pending queue entries.
    pub async fn queue_depth(&self) -> Result<usize> {
        Ok(self.store.list(QUEUE_PREFIX).await?.len())
    }
}
