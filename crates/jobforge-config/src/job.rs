//! Job definition parsing.

use crate::{ConfigError, ConfigResult};
use jobforge_core::{Job, JobId, Step};
use kdl::{KdlDocument, KdlNode};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Parse a document holding exactly one job.
pub fn parse_job(kdl: &str) -> ConfigResult<Job> {
    let mut jobs = parse_jobs(kdl)?;
    match jobs.len() {
        1 => Ok(jobs.remove(0)),
        0 => Err(ConfigError::MissingField("job".to_string())),
        n => Err(ConfigError::InvalidValue {
            field: "job".to_string(),
            message: format!("expected one job, found {}", n),
        }),
    }
}

/// Parse every `job` node of a document.
pub fn parse_jobs(kdl: &str) -> ConfigResult<Vec<Job>> {
    let doc: KdlDocument = kdl.parse()?;

    let mut jobs = Vec::new();
    let mut seen = HashSet::new();
    for node in doc.nodes() {
        if node.name().value() != "job" {
            continue; // Ignore unknown nodes
        }
        let job = parse_job_node(node)?;
        if !seen.insert(job.id.clone()) {
            return Err(ConfigError::Duplicate(format!("job '{}'", job.id)));
        }
        jobs.push(job);
    }
    Ok(jobs)
}

/// Read and parse a job file.
pub fn load_jobs(path: &Path) -> ConfigResult<Vec<Job>> {
    let content = std::fs::read_to_string(path)?;
    parse_jobs(&content)
}

fn parse_job_node(node: &KdlNode) -> ConfigResult<Job> {
    let id = get_first_string_arg(node)
        .map(JobId::new)
        .unwrap_or_else(JobId::generate);

    let priority = match get_int_prop(node, "priority") {
        Some(p) => u8::try_from(p).map_err(|_| ConfigError::InvalidValue {
            field: "priority".to_string(),
            message: format!("{} is out of range", p),
        })?,
        None => 0,
    };
    let timeout = get_u64_prop(node, "timeout")?;

    let mut repo = None;
    let mut commit = None;
    let mut branch = None;
    let mut env = HashMap::new();
    let mut cache_keys = Vec::new();
    let mut steps = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "repo" => repo = get_first_string_arg(child),
                "commit" => commit = get_first_string_arg(child),
                "branch" => branch = get_first_string_arg(child),
                "env" => env = parse_env(child),
                "cache-key" => cache_keys.extend(get_all_string_args(child)),
                "step" => steps.push(parse_step(child)?),
                _ => {}
            }
        }
    }

    let job = Job {
        repo: repo.ok_or_else(|| ConfigError::MissingField(format!("repo for job '{}'", id)))?,
        commit: commit
            .ok_or_else(|| ConfigError::MissingField(format!("commit for job '{}'", id)))?,
        id,
        branch,
        steps,
        env,
        cache_keys,
        timeout,
        priority,
    };
    job.validate()?;
    Ok(job)
}

fn parse_step(node: &KdlNode) -> ConfigResult<Step> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("step name".to_string()))?;

    let mut step = Step::new(name, String::new());
    step.continue_on_error = get_bool_prop(node, "continue-on-error").unwrap_or(false);
    step.timeout = get_u64_prop(node, "timeout")?;

    let mut commands = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "run" => {
                    if let Some(cmd) = get_first_string_arg(child) {
                        commands.push(cmd);
                    }
                }
                "working-dir" => step.working_dir = get_first_string_arg(child),
                "env" => step.env = parse_env(child),
                _ => {}
            }
        }
    }

    if commands.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "run for step '{}'",
            step.name
        )));
    }
    // Several `run` lines form one script that stops at the first failure.
    step.run = commands.join(" && ");
    Ok(step)
}

fn parse_env(node: &KdlNode) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if let Some(val) = get_first_string_arg(child) {
                env.insert(key, val);
            }
        }
    }
    env
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_int_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match get_int_prop(node, name) {
        Some(v) => u64::try_from(v)
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: name.to_string(),
                message: format!("{} is not a valid number of seconds", v),
            }),
        None => Ok(None),
    }
}
