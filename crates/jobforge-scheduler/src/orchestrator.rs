//! Job orchestrator - runs a job's steps in order against its sandbox.
//!
//! Every failure inside a run converges on a terminal [`JobStatus`]; only a
//! missing status record or a broken store surfaces as an error.

use crate::logs;
use crate::queue::JobQueue;
use futures::stream::BoxStream;
use jobforge_cache::{CacheManager, all_default_paths, detect_cache_paths};
use jobforge_config::VariableContext;
use jobforge_core::sandbox::shell_quote;
use jobforge_core::{
    Error, ExecOptions, ExecOutput, Job, JobId, JobState, JobStatus, Result, Sandbox,
    StateManager, Step, StepResult, StepState,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Exit code recorded for steps stopped by a timeout.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Exit code recorded when a command could not be dispatched.
pub const DISPATCH_EXIT_CODE: i64 = 1;

/// How long a timed-out command gets to tear down after cancellation.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Budget for steps that set no timeout of their own.
    pub default_step_timeout: Duration,
    /// Poll interval of log streams.
    pub log_poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: Duration::from_secs(300),
            log_poll_interval: Duration::from_secs(1),
        }
    }
}

/// How a command run ended.
enum CommandOutcome {
    Completed(ExecOutput),
    TimedOut,
    Failed(Error),
}

/// How a job run ended.
enum RunOutcome {
    Finished(JobState, Option<String>),
    /// Someone else moved the job to a terminal state.
    Interrupted,
}

/// Removes a job's token from the registry when the run ends.
struct ActiveJob<'a> {
    registry: &'a Mutex<HashMap<JobId, CancellationToken>>,
    job_id: JobId,
    token: CancellationToken,
}

impl Drop for ActiveJob<'_> {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.job_id);
    }
}

/// Orchestrates the execution of jobs.
pub struct Orchestrator {
    queue: Arc<JobQueue>,
    cache: Option<CacheManager>,
    state: Option<Arc<dyn StateManager>>,
    config: OrchestratorConfig,
    active: Mutex<HashMap<JobId, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(queue: Arc<JobQueue>, config: OrchestratorConfig) -> Self {
        Self {
            queue,
            cache: None,
            state: None,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Restore and save dependency caches around the steps.
    pub fn with_cache(mut self, cache: CacheManager) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Snapshot the workspace after successful jobs.
    pub fn with_state_manager(mut self, state: Arc<dyn StateManager>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Stop the in-flight run of a job, if any. Returns whether one was found.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        match self.active.lock().get(job_id) {
            Some(token) => {
                info!(job_id = %job_id, "Cancelling running job");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a run of the job is in flight.
    pub fn is_active(&self, job_id: &JobId) -> bool {
        self.active.lock().contains_key(job_id)
    }

    /// Stream the outputs of the job's steps as they finish.
    pub async fn stream_job_logs(&self, job_id: &JobId) -> Result<BoxStream<'static, String>> {
        logs::stream_job_logs(
            self.queue.clone(),
            job_id.clone(),
            self.config.log_poll_interval,
        )
        .await
    }

    /// Execute a job to a terminal status.
    ///
    /// Returns the final status. A job that another party already finished
    /// is left untouched and its stored status returned.
    pub async fn execute_job(&self, job: &Job, sandbox: &dyn Sandbox) -> Result<JobStatus> {
        let mut status = self
            .queue
            .get_job_status(&job.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("status of job '{}'", job.id)))?;
        if status.is_terminal() {
            debug!(job_id = %job.id, status = %status.status, "Job already finished");
            return Ok(status);
        }
        if status.status == JobState::Queued {
            status.mark_running();
        }
        if status.steps.len() != job.steps.len() {
            status.steps = job.steps.iter().map(|s| StepResult::pending(&s.name)).collect();
        }

        let active = self.register(&job.id);
        info!(job_id = %job.id, sandbox = sandbox.name(), steps = job.steps.len(), "Starting job");

        let outcome = self.run(job, sandbox, &mut status, &active.token).await;
        let (state, message) = match outcome {
            Ok(RunOutcome::Finished(state, message)) => (state, message),
            Ok(RunOutcome::Interrupted) => return self.stored_status(job, status).await,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Job run failed");
                (JobState::Failure, Some(e.to_string()))
            }
        };

        if let Some(stored) = self.queue.get_job_status(&job.id).await? {
            if !accepts(&stored, state) {
                info!(job_id = %job.id, status = %stored.status, "Job finished elsewhere");
                return Ok(stored);
            }
        }

        status.finish(state, message);
        self.queue.update_job_status(&job.id, &status).await?;
        info!(
            job_id = %job.id,
            status = %status.status,
            duration_ms = status.duration.unwrap_or_default(),
            "Job finished"
        );
        Ok(status)
    }

    fn register(&self, job_id: &JobId) -> ActiveJob<'_> {
        let token = CancellationToken::new();
        self.active.lock().insert(job_id.clone(), token.clone());
        ActiveJob {
            registry: &self.active,
            job_id: job_id.clone(),
            token,
        }
    }

    async fn stored_status(&self, job: &Job, fallback: JobStatus) -> Result<JobStatus> {
        Ok(self.queue.get_job_status(&job.id).await?.unwrap_or(fallback))
    }

    /// Write the status unless the stored lifecycle has moved past it.
    async fn persist(&self, status: &JobStatus) -> Result<bool> {
        if let Some(stored) = self.queue.get_job_status(&status.job_id).await? {
            if !accepts(&stored, status.status) {
                return Ok(false);
            }
        }
        self.queue.update_job_status(&status.job_id, status).await?;
        Ok(true)
    }

    async fn run(
        &self,
        job: &Job,
        sandbox: &dyn Sandbox,
        status: &mut JobStatus,
        token: &CancellationToken,
    ) -> Result<RunOutcome> {
        let deadline = job.time_budget().map(|budget| Instant::now() + budget);
        if !self.persist(status).await? {
            return Ok(RunOutcome::Interrupted);
        }

        if let Some(message) = self.setup_workspace(job, sandbox, token).await {
            if token.is_cancelled() {
                return Ok(RunOutcome::Finished(JobState::Cancelled, Some("job cancelled".into())));
            }
            return Ok(RunOutcome::Finished(JobState::Failure, Some(message)));
        }

        let cache_key = match &self.cache {
            Some(cache) => Some(self.restore_cache(cache, job, sandbox).await),
            None => None,
        };

        let mut ctx = VariableContext::for_job(job);

        for (idx, step) in job.steps.iter().enumerate() {
            status.current_step = idx;
            status.steps[idx] = StepResult::started(&step.name);
            if !self.persist(status).await? {
                return Ok(RunOutcome::Interrupted);
            }

            let step_limit = step
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(self.config.default_step_timeout);
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let (limit, budget_binds) = match remaining {
                Some(remaining) if remaining < step_limit => (remaining, true),
                _ => (step_limit, false),
            };

            ctx.enter_step(&step.name, idx, &step.env);
            let (result, timed_out) = self
                .execute_step(step, &ctx, sandbox, limit, token)
                .await;
            let failed = result.status == StepState::Failure;
            status.steps[idx] = result;

            if !self.persist(status).await? {
                return Ok(RunOutcome::Interrupted);
            }
            if token.is_cancelled() {
                return Ok(RunOutcome::Finished(JobState::Cancelled, Some("job cancelled".into())));
            }
            if failed && timed_out && budget_binds {
                let budget = job.timeout.unwrap_or_default();
                warn!(job_id = %job.id, step = %step.name, "Job exceeded its time budget");
                return Ok(RunOutcome::Finished(
                    JobState::Timeout,
                    Some(
                        Error::Timeout(format!(
                            "job exceeded its {}s time budget during step '{}'",
                            budget, step.name
                        ))
                        .to_string(),
                    ),
                ));
            }
            if failed && !step.continue_on_error {
                return Ok(RunOutcome::Finished(
                    JobState::Failure,
                    Some(format!("step '{}' failed", step.name)),
                ));
            }
        }

        if !status.all_steps_passed() {
            return Ok(RunOutcome::Finished(
                JobState::Failure,
                Some("one or more steps failed".to_string()),
            ));
        }

        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            if !job.cache_keys.is_empty() {
                self.save_cache(cache, job, &key, sandbox).await;
            }
        }
        if let Some(state) = &self.state {
            let paths = vec![sandbox.workspace_root().to_string()];
            match state.create_snapshot(sandbox, &job.id, &job.commit, &paths).await {
                Ok(snapshot) => {
                    info!(job_id = %job.id, location = %snapshot.location, "Workspace snapshot saved")
                }
                Err(e) => warn!(job_id = %job.id, error = %e, "Workspace snapshot failed"),
            }
        }

        Ok(RunOutcome::Finished(JobState::Success, None))
    }

    /// Execute one step. Returns its result and whether the time limit hit.
    pub async fn execute_step(
        &self,
        step: &Step,
        ctx: &VariableContext,
        sandbox: &dyn Sandbox,
        limit: Duration,
        token: &CancellationToken,
    ) -> (StepResult, bool) {
        let mut result = StepResult::started(&step.name);

        let command = ctx.interpolate(&step.run);
        let working_dir = resolve_dir(
            sandbox.workspace_root(),
            step.working_dir.as_deref().map(|d| ctx.interpolate(d)),
        );
        let options = ExecOptions {
            working_dir: Some(working_dir),
            env: ctx.interpolate_map(&ctx.env),
        };

        info!(step = %step.name, index = ctx.step.index, "Running step");
        let timed_out = match run_command(sandbox, &command, options, limit, token).await {
            CommandOutcome::Completed(output) => {
                let state = if output.success() {
                    StepState::Success
                } else {
                    StepState::Failure
                };
                result.finish(state, output.combined_output(), output.exit_code);
                false
            }
            CommandOutcome::TimedOut => {
                result.finish(
                    StepState::Failure,
                    Error::Timeout(format!("step '{}' timed out after {:?}", step.name, limit))
                        .to_string(),
                    TIMEOUT_EXIT_CODE,
                );
                true
            }
            CommandOutcome::Failed(e) => {
                result.finish(StepState::Failure, e.to_string(), DISPATCH_EXIT_CODE);
                false
            }
        };

        if result.status == StepState::Success {
            info!(step = %step.name, duration_ms = result.duration.unwrap_or_default(), "Step succeeded");
        } else {
            warn!(step = %step.name, exit_code = result.exit_code, "Step failed");
        }
        (result, timed_out)
    }

    /// Clean the checkout root, clone and check out. Returns an error message
    /// on failure.
    async fn setup_workspace(
        &self,
        job: &Job,
        sandbox: &dyn Sandbox,
        token: &CancellationToken,
    ) -> Option<String> {
        let script = format!(
            "find . -mindepth 1 -delete && git clone --quiet {} . && git checkout --quiet {}",
            shell_quote(&job.repo),
            shell_quote(&job.commit)
        );
        let options = ExecOptions {
            working_dir: Some(sandbox.workspace_root().to_string()),
            env: job.env.clone(),
        };

        debug!(job_id = %job.id, repo = %job.repo, commit = %job.commit, "Setting up workspace");
        match run_command(sandbox, &script, options, self.config.default_step_timeout, token).await
        {
            CommandOutcome::Completed(output) if output.success() => None,
            CommandOutcome::Completed(output) => Some(format!(
                "workspace setup failed (exit {}): {}",
                output.exit_code,
                output.combined_output().trim()
            )),
            CommandOutcome::TimedOut => Some("workspace setup timed out".to_string()),
            CommandOutcome::Failed(e) => Some(format!("workspace setup failed: {}", e)),
        }
    }

    async fn restore_cache(&self, cache: &CacheManager, job: &Job, sandbox: &dyn Sandbox) -> String {
        let key = cache
            .generate_cache_key(&job.repo, &job.commit, &job.cache_keys, Some(sandbox))
            .await;
        match cache.restore_cache(&key, sandbox).await {
            Ok(true) => info!(job_id = %job.id, cache_key = %key, "Cache restored"),
            Ok(false) => debug!(job_id = %job.id, cache_key = %key, "No cache to restore"),
            Err(e) => warn!(job_id = %job.id, error = %e, "Cache restore failed"),
        }
        key
    }

    async fn save_cache(&self, cache: &CacheManager, job: &Job, key: &str, sandbox: &dyn Sandbox) {
        let mut paths = detect_cache_paths(&job.cache_keys);
        if paths.is_empty() {
            paths = all_default_paths();
        }
        match cache.save_cache(key, &paths, sandbox).await {
            Ok(saved) => debug!(job_id = %job.id, cache_key = %saved.key, size = saved.size, "Cache saved"),
            Err(Error::NoCacheableDirectories(_)) => {
                debug!(job_id = %job.id, "Nothing to cache")
            }
            Err(e) => warn!(job_id = %job.id, error = %e, "Cache save failed"),
        }
    }
}

/// Relative step directories resolve against the checkout root.
fn resolve_dir(root: &str, dir: Option<String>) -> String {
    match dir {
        Some(dir) if dir.starts_with('/') => dir,
        Some(dir) if !dir.is_empty() => {
            format!("{}/{}", root.trim_end_matches('/'), dir.trim_start_matches("./"))
        }
        _ => root.to_string(),
    }
}

/// Race a command against its time limit and the job's token.
async fn run_command(
    sandbox: &dyn Sandbox,
    command: &str,
    options: ExecOptions,
    limit: Duration,
    token: &CancellationToken,
) -> CommandOutcome {
    let cancel = token.child_token();
    let exec = sandbox.exec(command, options, cancel.clone());
    tokio::pin!(exec);

    tokio::select! {
        result = &mut exec => match result {
            Ok(output) => CommandOutcome::Completed(output),
            Err(e) => CommandOutcome::Failed(e),
        },
        _ = tokio::time::sleep(limit) => {
            cancel.cancel();
            if tokio::time::timeout(CANCEL_GRACE, exec).await.is_err() {
                warn!(command, "Command did not stop within {:?} of cancellation", CANCEL_GRACE);
            }
            CommandOutcome::TimedOut
        }
    }
}

/// Whether a stored status may be overwritten with one in state `next`.
fn accepts(stored: &JobStatus, next: JobState) -> bool {
    (stored.status == next && !stored.is_terminal()) || stored.status.can_transition_to(next)
}
