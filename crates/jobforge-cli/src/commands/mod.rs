//! CLI command implementations.

pub mod cache;
pub mod run;

use anyhow::{Context, Result};
use jobforge_config::load_jobs;
use jobforge_core::Job;
use std::path::PathBuf;

/// Load every job from the given files.
pub fn load_all(files: &[PathBuf]) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    for path in files {
        let loaded = load_jobs(path)
            .with_context(|| format!("Failed to load job file: {}", path.display()))?;
        if loaded.is_empty() {
            anyhow::bail!("No jobs defined in {}", path.display());
        }
        jobs.extend(loaded);
    }
    Ok(jobs)
}

pub fn validate(files: &[PathBuf]) -> Result<()> {
    let mut failed = false;
    for path in files {
        match load_jobs(path) {
            Ok(jobs) if jobs.is_empty() => {
                println!("{}: no jobs defined", path.display());
                failed = true;
            }
            Ok(jobs) => {
                for job in &jobs {
                    println!(
                        "{}: job '{}' ({} steps) is valid",
                        path.display(),
                        job.id,
                        job.steps.len()
                    );
                }
            }
            Err(e) => {
                println!("{}: {}", path.display(), e);
                failed = true;
            }
        }
    }
    if failed {
        anyhow::bail!("Validation failed");
    }
    Ok(())
}
