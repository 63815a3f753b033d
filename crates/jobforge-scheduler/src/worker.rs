//! Worker that dispatches queued jobs to sandboxes.

use crate::orchestrator::Orchestrator;
use crate::queue::JobQueue;
use jobforge_core::{Job, JobId, JobState, Result, SandboxProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// A worker that claims jobs on a fixed interval and runs each in its own
/// sandbox.
pub struct Worker {
    id: String,
    queue: Arc<JobQueue>,
    orchestrator: Arc<Orchestrator>,
    sandboxes: Arc<dyn SandboxProvider>,
    poll_interval: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        orchestrator: Arc<Orchestrator>,
        sandboxes: Arc<dyn SandboxProvider>,
    ) -> Self {
        Self {
            id: id.into(),
            queue: orchestrator.queue().clone(),
            orchestrator,
            sandboxes,
            poll_interval: Duration::from_secs(1),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run the dispatch loop until [`Worker::shutdown`] is called.
    pub async fn run(&self) {
        info!(worker_id = %self.id, interval = ?self.poll_interval, "Starting worker");

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.dispatch().await,
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Claim jobs until the queue is empty or at capacity.
    pub async fn dispatch(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        loop {
            match self.queue.dequeue().await {
                Ok(Some(job)) => {
                    info!(worker_id = %self.id, job_id = %job.id, "Claimed job");
                    self.tracker.spawn(run_job(
                        job,
                        self.orchestrator.clone(),
                        self.sandboxes.clone(),
                    ));
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to claim job");
                    break;
                }
            }
        }
    }

    /// Cancel a job whether it is still queued or already running.
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<bool> {
        let cancelled = self.queue.cancel_job(job_id).await?;
        self.orchestrator.cancel(job_id);
        Ok(cancelled)
    }

    /// Number of jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop claiming and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        info!(worker_id = %self.id, in_flight = self.tracker.len(), "Draining worker");
        self.tracker.wait().await;
    }
}

async fn run_job(job: Job, orchestrator: Arc<Orchestrator>, sandboxes: Arc<dyn SandboxProvider>) {
    let sandbox = match sandboxes.acquire(&job).await {
        Ok(sandbox) => sandbox,
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Failed to acquire sandbox");
            fail_unstarted(&orchestrator, &job, format!("sandbox unavailable: {}", e)).await;
            return;
        }
    };

    match orchestrator.execute_job(&job, sandbox.as_ref()).await {
        Ok(status) => info!(job_id = %job.id, status = %status.status, "Job completed"),
        Err(e) => error!(job_id = %job.id, error = %e, "Job execution failed"),
    }

    if let Err(e) = sandboxes.release(&job, sandbox).await {
        warn!(job_id = %job.id, error = %e, "Failed to release sandbox");
    }
}

async fn fail_unstarted(orchestrator: &Orchestrator, job: &Job, message: String) {
    let queue = orchestrator.queue();
    let result = async {
        if let Some(mut status) = queue.get_job_status(&job.id).await? {
            if !status.is_terminal() {
                status.finish(JobState::Failure, Some(message));
                queue.update_job_status(&job.id, &status).await?;
            }
        }
        Ok::<_, jobforge_core::Error>(())
    };
    if let Err(e) = result.await {
        warn!(job_id = %job.id, error = %e, "Failed to record sandbox failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::OrchestratorConfig;
    use crate::queue::QueueConfig;
    use crate::testing::ScriptedProvider;
    use jobforge_core::{JobStatus, Step, StepState};
    use jobforge_store::MemoryMetadataStore;

    fn worker(provider: Arc<ScriptedProvider>, max_concurrent: usize) -> Arc<Worker> {
        let queue = Arc::new(JobQueue::new(
            Arc::new(MemoryMetadataStore::new()),
            QueueConfig {
                max_concurrent,
                ..Default::default()
            },
        ));
        let orchestrator = Arc::new(Orchestrator::new(queue, OrchestratorConfig::default()));
        Arc::new(
            Worker::new("test-worker", orchestrator, provider)
                .with_poll_interval(Duration::from_millis(10)),
        )
    }

    async fn wait_terminal(worker: &Worker, job_id: &JobId) -> JobStatus {
        loop {
            let status = worker.queue.get_job_status(job_id).await.unwrap().unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn job(id: &str, run: &str) -> Job {
        Job::new(id, "https://example.com/app.git", "abc1234").with_step(Step::new("main", run))
    }

    #[tokio::test]
    async fn test_runs_queued_jobs_to_completion() {
        let provider = Arc::new(ScriptedProvider::new());
        let worker = worker(provider.clone(), 2);
        for id in ["a", "b", "c"] {
            worker.queue.enqueue(&job(id, "sleep 0.02")).await.unwrap();
        }

        let runner = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        };
        for id in ["a", "b", "c"] {
            let status = wait_terminal(&worker, &JobId::new(id)).await;
            assert_eq!(status.status, JobState::Success);
        }

        worker.shutdown().await;
        runner.await.unwrap();
        assert_eq!(provider.acquired(), 3);
        assert_eq!(provider.released(), 3);
        assert_eq!(worker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_respects_capacity() {
        let worker = worker(Arc::new(ScriptedProvider::new()), 1);
        worker.queue.enqueue(&job("first", "sleep 0.2")).await.unwrap();
        worker.queue.enqueue(&job("second", "echo hi")).await.unwrap();

        worker.dispatch().await;
        assert_eq!(worker.in_flight(), 1);
        assert_eq!(worker.queue.queue_depth().await.unwrap(), 1);

        worker.shutdown().await;
        let first = worker.queue.get_job_status(&JobId::new("first")).await.unwrap().unwrap();
        assert_eq!(first.status, JobState::Success);
        let second = worker.queue.get_job_status(&JobId::new("second")).await.unwrap().unwrap();
        assert_eq!(second.status, JobState::Queued);
    }

    #[tokio::test]
    async fn test_sandbox_failure_fails_job() {
        let worker = worker(Arc::new(ScriptedProvider::unavailable()), 2);
        worker.queue.enqueue(&job("doomed", "echo hi")).await.unwrap();

        worker.dispatch().await;
        worker.shutdown().await;

        let status = worker.queue.get_job_status(&JobId::new("doomed")).await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Failure);
        assert!(status.error.as_deref().unwrap().starts_with("sandbox unavailable"));
        assert_eq!(status.steps[0].status, StepState::Pending);
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let provider = Arc::new(ScriptedProvider::new());
        let worker = worker(provider.clone(), 2);
        let id = JobId::new("long");
        worker.queue.enqueue(&job("long", "sleep 30")).await.unwrap();

        worker.dispatch().await;
        while !worker.orchestrator.is_active(&id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(worker.cancel_job(&id).await.unwrap());

        worker.shutdown().await;
        let status = worker.queue.get_job_status(&id).await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Cancelled);
        assert_eq!(provider.released(), 1);
    }

    #[tokio::test]
    async fn test_no_dispatch_after_shutdown() {
        let worker = worker(Arc::new(ScriptedProvider::new()), 2);
        worker.shutdown().await;
        worker.queue.enqueue(&job("late", "echo hi")).await.unwrap();

        worker.dispatch().await;
        assert_eq!(worker.queue.queue_depth().await.unwrap(), 1);
    }
}
