//! Polling log stream over a job's status record.

use crate::queue::JobQueue;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use jobforge_core::{JobId, JobStatus, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::warn;

struct Cursor {
    queue: Arc<JobQueue>,
    job_id: JobId,
    next_step: usize,
    ticker: Interval,
    buffered: VecDeque<String>,
    done: bool,
}

impl Cursor {
    /// Buffer outputs of steps that finished since the last poll.
    fn collect(&mut self, status: &JobStatus) {
        while let Some(step) = status.steps.get(self.next_step) {
            if !step.status.is_finished() {
                break;
            }
            if !step.output.is_empty() {
                self.buffered.push_back(step.output.clone());
            }
            self.next_step += 1;
        }
        if status.is_terminal() {
            self.done = true;
        }
    }
}

/// Stream step outputs of a job as they finish.
///
/// Starts at the job's current step and polls the status every `interval`.
/// The stream ends once the job is terminal and everything has been
/// emitted, or immediately when the job is unknown.
pub async fn stream_job_logs(
    queue: Arc<JobQueue>,
    job_id: JobId,
    interval: Duration,
) -> Result<BoxStream<'static, String>> {
    let Some(status) = queue.get_job_status(&job_id).await? else {
        return Ok(stream::empty().boxed());
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let cursor = Cursor {
        queue,
        job_id,
        next_step: status.current_step,
        ticker,
        buffered: VecDeque::new(),
        done: false,
    };

    let logs = stream::unfold(cursor, |mut cursor| async move {
        loop {
            if let Some(chunk) = cursor.buffered.pop_front() {
                return Some((chunk, cursor));
            }
            if cursor.done {
                return None;
            }

            cursor.ticker.tick().await;
            match cursor.queue.get_job_status(&cursor.job_id).await {
                Ok(Some(status)) => cursor.collect(&status),
                Ok(None) => return None,
                Err(e) => {
                    warn!(job_id = %cursor.job_id, error = %e, "Log stream poll failed");
                }
            }
        }
    });

    Ok(logs.boxed())
}
