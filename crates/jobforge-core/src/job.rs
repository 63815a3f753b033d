//! Job and step definitions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::{Error, JobId, Result};

/// Highest accepted job priority.
pub const MAX_PRIORITY: u8 = 10;

/// A unit of work: checkout, ordered steps, optional caching.
///
/// Jobs are immutable once submitted. The queue retains the original
/// definition so failed jobs can be retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Caller-assigned unique id.
    pub id: JobId,
    /// Source repository location.
    pub repo: String,
    /// Revision to check out.
    pub commit: String,
    /// Branch name, informational only.
    #[serde(default)]
    pub branch: Option<String>,
    /// Steps, executed strictly in order.
    pub steps: Vec<Step>,
    /// Environment applied to every step.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Manifest files whose contents feed the cache key, in order.
    #[serde(default)]
    pub cache_keys: Vec<String>,
    /// Whole-job budget in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// 0-10, higher is scheduled sooner.
    #[serde(default)]
    pub priority: u8,
}

/// One command executed within a job's workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    /// Command line, run through the sandbox shell.
    pub run: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Keep going after this step fails. The job still ends in failure.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Per-step budget in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl Job {
    pub fn new(id: impl Into<JobId>, repo: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            repo: repo.into(),
            commit: commit.into(),
            branch: None,
            steps: Vec::new(),
            env: HashMap::new(),
            cache_keys: Vec::new(),
            timeout: None,
            priority: 0,
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn with_cache_key(mut self, manifest: impl Into<String>) -> Self {
        self.cache_keys.push(manifest.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Whole-job budget, if any.
    pub fn time_budget(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }

    /// Check the fields the scheduler relies on.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::Validation("job id is required".to_string()));
        }
        if self.repo.trim().is_empty() {
            return Err(Error::Validation(format!("job '{}' has no repo", self.id)));
        }
        if self.commit.trim().is_empty() {
            return Err(Error::Validation(format!("job '{}' has no commit", self.id)));
        }
        if self.steps.is_empty() {
            return Err(Error::Validation(format!("job '{}' has no steps", self.id)));
        }
        if self.priority > MAX_PRIORITY {
            return Err(Error::Validation(format!(
                "job '{}' priority {} is outside 0-{}",
                self.id, self.priority, MAX_PRIORITY
            )));
        }
        for (idx, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "job '{}' step {} has no name",
                    self.id, idx
                )));
            }
            if step.run.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "job '{}' step '{}' has no command",
                    self.id, step.name
                )));
            }
        }
        Ok(())
    }
}

impl Step {
    pub fn new(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: run.into(),
            working_dir: None,
            env: HashMap::new(),
            continue_on_error: false,
            timeout: None,
        }
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_job() -> Job {
        Job::new("job-1", "https://example.com/repo.git", "abc123")
            .with_step(Step::new("build", "make"))
    }

    #[test]
    fn test_valid_job_passes() {
        assert!(valid_job().validate().is_ok());
    }

    #[test]
    fn test_missing_fields_rejected() {
        let mut job = valid_job();
        job.commit = String::new();
        assert!(matches!(job.validate(), Err(Error::Validation(_))));

        let mut job = valid_job();
        job.steps.clear();
        assert!(matches!(job.validate(), Err(Error::Validation(_))));

        let mut job = valid_job();
        job.id = JobId::new("  ");
        assert!(matches!(job.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_priority_bound() {
        let job = valid_job().with_priority(11);
        assert!(matches!(job.validate(), Err(Error::Validation(_))));
        assert!(valid_job().with_priority(10).validate().is_ok());
    }

    #[test]
    fn test_json_uses_camel_case() {
        let job = valid_job()
            .with_cache_key("Cargo.lock")
            .with_step(Step::new("test", "make test").continue_on_error());
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["cacheKeys"][0], "Cargo.lock");
        assert_eq!(json["steps"][1]["continueOnError"], true);

        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }
}
