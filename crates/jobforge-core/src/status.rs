//! Job and step status records.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::job::Job;
use crate::{Error, JobId};

/// Lifecycle state of a job.
///
/// Transitions only move forward: `queued -> running -> terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[display("queued")]
    Queued,
    #[display("running")]
    Running,
    #[display("success")]
    Success,
    #[display("failure")]
    Failure,
    #[display("timeout")]
    Timeout,
    #[display("cancelled")]
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failure | JobState::Timeout | JobState::Cancelled
        )
    }

    /// Whether moving from `self` to `next` respects the forward-only lifecycle.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match self {
            JobState::Queued => next != JobState::Queued,
            JobState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "success" => Ok(JobState::Success),
            "failure" => Ok(JobState::Failure),
            "timeout" => Ok(JobState::Timeout),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(Error::Validation(format!("unknown job status: {}", other))),
        }
    }
}

/// State of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    #[display("pending")]
    Pending,
    #[display("running")]
    Running,
    #[display("success")]
    Success,
    #[display("failure")]
    Failure,
    /// Reserved for schedulers that decide not to run a step.
    #[display("skipped")]
    Skipped,
}

impl StepState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            StepState::Success | StepState::Failure | StepState::Skipped
        )
    }

    /// Counts toward an overall successful job.
    pub fn is_passing(&self) -> bool {
        matches!(self, StepState::Success | StepState::Skipped)
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub name: String,
    pub status: StepState,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Milliseconds.
    #[serde(default)]
    pub duration: Option<i64>,
}

impl StepResult {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepState::Pending,
            output: String::new(),
            exit_code: None,
            started_at: None,
            finished_at: None,
            duration: None,
        }
    }

    /// A result in the `running` state, stamped now.
    pub fn started(name: impl Into<String>) -> Self {
        Self {
            status: StepState::Running,
            started_at: Some(Utc::now()),
            ..Self::pending(name)
        }
    }

    /// Move to a terminal state, stamping `finishedAt` and `duration`.
    pub fn finish(&mut self, status: StepState, output: String, exit_code: i64) {
        let finished_at = Utc::now();
        self.status = status;
        self.output = output;
        self.exit_code = Some(exit_code);
        self.finished_at = Some(finished_at);
        self.duration = self.started_at.map(|s| elapsed_ms(s, finished_at));
    }
}

/// Mutable status record of a job, owned by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: JobId,
    pub status: JobState,
    /// Index of the step being (or last) executed.
    pub current_step: usize,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Milliseconds.
    #[serde(default)]
    pub duration: Option<i64>,
    pub steps: Vec<StepResult>,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobStatus {
    /// Fresh `queued` status with one pending slot per step.
    pub fn queued(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            status: JobState::Queued,
            current_step: 0,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            duration: None,
            steps: job
                .steps
                .iter()
                .map(|s| StepResult::pending(&s.name))
                .collect(),
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_running(&mut self) {
        self.status = JobState::Running;
        self.started_at = Some(Utc::now());
    }

    /// Enter a terminal state, stamping `finishedAt` and `duration`.
    pub fn finish(&mut self, status: JobState, error: Option<String>) {
        let finished_at = Utc::now();
        self.status = status;
        if error.is_some() {
            self.error = error;
        }
        self.finished_at = Some(finished_at);
        self.duration = self.started_at.map(|s| elapsed_ms(s, finished_at));
    }

    /// Whether every step ended in a passing state.
    pub fn all_steps_passed(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_passing())
    }
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_milliseconds()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Step;

    #[test]
    fn test_queued_status_prepopulates_steps() {
        let job = Job::new("j", "repo", "sha")
            .with_step(Step::new("a", "true"))
            .with_step(Step::new("b", "true"));
        let status = JobStatus::queued(&job);

        assert_eq!(status.status, JobState::Queued);
        assert_eq!(status.steps.len(), 2);
        assert!(status.steps.iter().all(|s| s.status == StepState::Pending));
    }

    #[test]
    fn test_transitions_are_forward_only() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Queued.can_transition_to(JobState::Cancelled));
        assert!(JobState::Running.can_transition_to(JobState::Timeout));
        assert!(!JobState::Running.can_transition_to(JobState::Queued));
        assert!(!JobState::Success.can_transition_to(JobState::Failure));
        assert!(!JobState::Cancelled.can_transition_to(JobState::Running));
    }

    #[test]
    fn test_finish_computes_duration() {
        let job = Job::new("j", "repo", "sha").with_step(Step::new("a", "true"));
        let mut status = JobStatus::queued(&job);
        status.mark_running();
        status.finish(JobState::Success, None);

        let started = status.started_at.unwrap();
        let finished = status.finished_at.unwrap();
        assert_eq!(
            status.duration,
            Some((finished - started).num_milliseconds())
        );
    }

    #[test]
    fn test_finish_without_start_leaves_duration_unset() {
        let job = Job::new("j", "repo", "sha").with_step(Step::new("a", "true"));
        let mut status = JobStatus::queued(&job);
        status.finish(JobState::Cancelled, None);
        assert!(status.finished_at.is_some());
        assert_eq!(status.duration, None);
    }

    #[test]
    fn test_state_round_trips_through_strings() {
        for state in [
            JobState::Queued,
            JobState::Running,
            JobState::Success,
            JobState::Failure,
            JobState::Timeout,
            JobState::Cancelled,
        ] {
            assert_eq!(state.to_string().parse::<JobState>().unwrap(), state);
        }
        assert!("bogus".parse::<JobState>().is_err());
    }

    #[test]
    fn test_skipped_counts_as_passing() {
        assert!(StepState::Skipped.is_passing());
        assert!(!StepState::Pending.is_passing());
        assert!(!StepState::Failure.is_passing());
    }
}
