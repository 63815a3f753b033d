//! Variable interpolation for step commands.
//!
//! Supports variables like:
//! - `${job.id}` - Job id
//! - `${job.priority}` - Job priority
//! - `${git.repo}` - Repository location
//! - `${git.commit}` / `${git.sha}` - Commit being built
//! - `${git.short_sha}` - Short (7 char) commit
//! - `${git.branch}` - Branch name (empty when unknown)
//! - `${step.name}` - Current step name
//! - `${step.index}` - Current step index (0-based)
//! - `${env.VAR_NAME}` - Job or step environment variable
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)
//! - `${datetime}` - ISO datetime
//!
//! Unknown variables are left untouched so the shell can still expand
//! anything that is not ours.

use jobforge_core::Job;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub git: GitContext,
    pub job: JobContext,
    pub step: StepContext,
    /// Job env overlaid with the current step's env.
    pub env: HashMap<String, String>,
    /// Custom variables defined by the caller.
    pub custom: HashMap<String, String>,
    job_env: HashMap<String, String>,
}

/// Source revision being built.
#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub repo: String,
    pub commit: String,
    pub short_sha: String,
    pub branch: String,
}

#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub id: String,
    pub priority: u8,
}

#[derive(Debug, Clone, Default)]
pub struct StepContext {
    pub name: String,
    pub index: usize,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a job, before any step is selected.
    pub fn for_job(job: &Job) -> Self {
        Self {
            git: GitContext {
                repo: job.repo.clone(),
                commit: job.commit.clone(),
                short_sha: job.commit.chars().take(7).collect(),
                branch: job.branch.clone().unwrap_or_default(),
            },
            job: JobContext {
                id: job.id.to_string(),
                priority: job.priority,
            },
            step: StepContext::default(),
            env: job.env.clone(),
            custom: HashMap::new(),
            job_env: job.env.clone(),
        }
    }

    /// Select the current step and overlay its env on the job env.
    pub fn enter_step(
        &mut self,
        name: impl Into<String>,
        index: usize,
        step_env: &HashMap<String, String>,
    ) {
        self.step = StepContext {
            name: name.into(),
            index,
        };
        self.env = self.job_env.clone();
        self.env.extend(step_env.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Add a custom variable.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["job", "id"] => Some(self.job.id.clone()),
            ["job", "priority"] => Some(self.job.priority.to_string()),

            ["git", "repo"] => Some(self.git.repo.clone()),
            ["git", "commit"] | ["git", "sha"] => Some(self.git.commit.clone()),
            ["git", "short_sha"] => Some(self.git.short_sha.clone()),
            ["git", "branch"] => Some(self.git.branch.clone()),

            ["step", "name"] => Some(self.step.name.clone()),
            ["step", "index"] => Some(self.step.index.to_string()),

            ["env", name] => self.env.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            ["datetime"] => Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),

            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Interpolate the values of a map.
    pub fn interpolate_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }
}
