//! Persisted key shapes.
//!
//! These layouts are read by external tooling and must stay stable.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::{Error, JobId};

pub const QUEUE_PREFIX: &str = "queue:";
pub const STATUS_PREFIX: &str = "status:";
pub const JOB_PREFIX: &str = "job:";
pub const CACHE_META_PREFIX: &str = "cache:";
pub const CACHE_BLOB_PREFIX: &str = "cache/";
pub const ARCHIVE_EXT: &str = "tar.gz";

pub fn status_key(job_id: &JobId) -> String {
    format!("{}{}", STATUS_PREFIX, job_id)
}

pub fn job_key(job_id: &JobId) -> String {
    format!("{}{}", JOB_PREFIX, job_id)
}

pub fn cache_meta_key(cache_key: &str) -> String {
    format!("{}{}", CACHE_META_PREFIX, cache_key)
}

pub fn cache_blob_path(cache_key: &str) -> String {
    format!("{}{}.{}", CACHE_BLOB_PREFIX, cache_key, ARCHIVE_EXT)
}

/// Inverse of [`cache_blob_path`].
pub fn cache_key_from_blob_path(path: &str) -> Option<&str> {
    path.strip_prefix(CACHE_BLOB_PREFIX)?
        .strip_suffix(ARCHIVE_EXT)?
        .strip_suffix('.')
}

/// Position of a job in the pending queue: `queue:{priority}:{timestamp}:{jobId}`.
///
/// The ordering makes the next job to dispatch the greatest element, so a
/// `BinaryHeap<QueueKey>` pops in dispatch order: higher priority first, then
/// earlier enqueue timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub priority: u8,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub job_id: JobId,
}

impl QueueKey {
    pub fn new(priority: u8, timestamp: i64, job_id: JobId) -> Self {
        Self {
            priority,
            timestamp,
            job_id,
        }
    }

    /// Whether a raw store key is a queue entry for exactly `job_id`.
    pub fn key_matches_job(raw: &str, job_id: &JobId) -> bool {
        raw.parse::<QueueKey>()
            .is_ok_and(|key| key.job_id == *job_id)
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.timestamp.cmp(&self.timestamp))
            .then_with(|| other.job_id.cmp(&self.job_id))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}:{}:{}",
            QUEUE_PREFIX, self.priority, self.timestamp, self.job_id
        )
    }
}

impl FromStr for QueueKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Validation(format!("malformed queue key: {}", s));
        let rest = s.strip_prefix(QUEUE_PREFIX).ok_or_else(invalid)?;
        // Job ids may themselves contain ':'.
        let mut parts = rest.splitn(3, ':');
        let priority = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .ok_or_else(invalid)?;
        let timestamp = parts
            .next()
            .and_then(|t| t.parse::<i64>().ok())
            .ok_or_else(invalid)?;
        let job_id = parts.next().filter(|id| !id.is_empty()).ok_or_else(invalid)?;
        Ok(Self::new(priority, timestamp, JobId::new(job_id)))
    }
}
