//! Local job execution command.

use super::load_all;
use anyhow::{Context, Result};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use jobforge_cache::CacheManager;
use jobforge_config::SystemConfig;
use jobforge_core::{JobId, JobState, MetadataStore, SandboxProvider, StepState};
use jobforge_sandbox::{DockerSandboxProvider, LocalSandboxProvider};
use jobforge_scheduler::{JobQueue, Orchestrator, OrchestratorConfig, QueueConfig, Worker};
use jobforge_store::{FsBlobStore, MemoryMetadataStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

fn sandbox_provider(config: &SystemConfig) -> Result<Arc<dyn SandboxProvider>> {
    match config.sandbox.backend.as_str() {
        "docker" => {
            let provider = DockerSandboxProvider::new(config.sandbox.image.clone())
                .context("Failed to connect to Docker")?;
            Ok(Arc::new(provider))
        }
        _ => Ok(Arc::new(LocalSandboxProvider::new(
            config.sandbox.base_dir.clone(),
        ))),
    }
}

/// Enqueue the jobs in `files` and run a worker until all of them finished.
pub async fn run_jobs(config: &SystemConfig, files: &[PathBuf]) -> Result<()> {
    let jobs = load_all(files)?;

    let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
    let queue = Arc::new(JobQueue::new(
        metadata.clone(),
        QueueConfig {
            max_concurrent: config.scheduler.max_concurrent,
            entry_ttl: config.scheduler.queue_entry_ttl,
        },
    ));

    let mut orchestrator = Orchestrator::new(
        queue.clone(),
        OrchestratorConfig {
            default_step_timeout: config.orchestrator.default_step_timeout,
            log_poll_interval: config.orchestrator.log_poll_interval,
        },
    );
    if config.cache.enabled {
        let cache = CacheManager::new(
            Arc::new(FsBlobStore::new(config.storage.blob_dir.clone())),
            metadata.clone(),
        )
        .with_retention(config.cache.retention);
        match cache.prune_caches(config.cache.retention).await {
            Ok(0) => {}
            Ok(pruned) => info!(pruned, "Pruned expired caches"),
            Err(e) => warn!(error = %e, "Failed to prune caches"),
        }
        orchestrator = orchestrator.with_cache(cache);
    }
    let orchestrator = Arc::new(orchestrator);

    let worker = Arc::new(
        Worker::new("cli", orchestrator.clone(), sandbox_provider(config)?)
            .with_poll_interval(config.scheduler.poll_interval),
    );

    let mut streams: Vec<BoxStream<'static, (JobId, String)>> = Vec::new();
    for job in &jobs {
        queue
            .enqueue(job)
            .await
            .with_context(|| format!("Failed to enqueue job '{}'", job.id))?;
        let id = job.id.clone();
        let logs = orchestrator.stream_job_logs(&job.id).await?;
        streams.push(logs.map(move |chunk| (id.clone(), chunk)).boxed());
    }
    println!("Running {} job(s) with the {} sandbox\n", jobs.len(), config.sandbox.backend);

    let runner = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    let mut logs = stream::select_all(streams);
    loop {
        tokio::select! {
            next = logs.next() => match next {
                Some((job_id, chunk)) => {
                    for line in chunk.lines() {
                        println!("[{}] {}", job_id, line);
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling jobs");
                for job in &jobs {
                    if let Err(e) = worker.cancel_job(&job.id).await {
                        warn!(job_id = %job.id, error = %e, "Failed to cancel job");
                    }
                }
            }
        }
    }

    worker.shutdown().await;
    runner.await.context("Worker task failed")?;

    println!("\n--- Job Summary ---");
    let mut failed = 0;
    for job in &jobs {
        let Some(status) = queue.get_job_status(&job.id).await? else {
            continue;
        };
        let marker = match status.status {
            JobState::Success => "✓",
            JobState::Cancelled => "⊘",
            _ => "✗",
        };
        if status.status != JobState::Success {
            failed += 1;
        }
        let duration = status
            .duration
            .map(|ms| format!(" in {:.1}s", ms as f64 / 1000.0))
            .unwrap_or_default();
        println!("{} {} - {}{}", marker, job.id, status.status, duration);
        for step in &status.steps {
            let state = match step.status {
                StepState::Success => "✓ succeeded".to_string(),
                StepState::Failure => format!("✗ failed (exit {})", step.exit_code.unwrap_or(-1)),
                StepState::Skipped => "⊘ skipped".to_string(),
                StepState::Pending => "○ pending".to_string(),
                StepState::Running => "▶ running".to_string(),
            };
            println!("    {} - {}", step.name, state);
        }
        if let Some(error) = &status.error {
            println!("    error: {}", error);
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} job(s) did not succeed", failed, jobs.len());
    }
    println!("\n✓ All jobs succeeded!");
    Ok(())
}
