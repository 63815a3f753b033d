//! System configuration parsing.
//!
//! Every setting has a default, so an empty document is a valid config.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// System-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    pub scheduler: SchedulerSettings,
    pub orchestrator: OrchestratorSettings,
    pub cache: CacheSettings,
    pub storage: StorageSettings,
    pub sandbox: SandboxSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Ceiling on simultaneously running jobs.
    pub max_concurrent: usize,
    /// Dequeue tick.
    pub poll_interval: Duration,
    /// Retention of pending queue entries.
    pub queue_entry_ttl: Duration,
    /// Age after which terminal job records are pruned.
    pub job_retention: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            poll_interval: Duration::from_secs(1),
            queue_entry_ttl: Duration::from_secs(24 * 60 * 60),
            job_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Budget for steps that set no timeout of their own.
    pub default_step_timeout: Duration,
    /// Poll interval of log streams.
    pub log_poll_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_step_timeout: Duration::from_secs(300),
            log_poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Metadata retention of saved caches.
    pub retention: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Root of the filesystem blob store.
    pub blob_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            blob_dir: PathBuf::from(".jobforge/blobs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// `local` or `docker`.
    pub backend: String,
    /// Image used by the docker backend. Needs `sh`, `git` and `tar`.
    pub image: String,
    /// Parent directory of per-job workspaces for the local backend.
    pub base_dir: PathBuf,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            image: "buildpack-deps:bookworm-scm".to_string(),
            base_dir: PathBuf::from(".jobforge/sandboxes"),
        }
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "scheduler" => parse_scheduler(node, &mut config.scheduler)?,
            "orchestrator" => parse_orchestrator(node, &mut config.orchestrator)?,
            "cache" => parse_cache(node, &mut config.cache)?,
            "storage" => {
                for child in children(node) {
                    if child.name().value() == "blob-dir" {
                        config.storage.blob_dir = PathBuf::from(required_string(child)?);
                    }
                }
            }
            "sandbox" => parse_sandbox(node, &mut config.sandbox)?,
            _ => {} // Ignore unknown nodes
        }
    }

    if config.scheduler.max_concurrent == 0 {
        return Err(ConfigError::InvalidValue {
            field: "max-concurrent".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    Ok(config)
}

/// Read and parse a system configuration file.
pub fn load_system_config(path: &Path) -> ConfigResult<SystemConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_system_config(&content)
}

fn parse_scheduler(node: &KdlNode, settings: &mut SchedulerSettings) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "max-concurrent" => settings.max_concurrent = required_u64(child)? as usize,
            "poll-interval-ms" => settings.poll_interval = Duration::from_millis(required_u64(child)?),
            "queue-entry-ttl-secs" => {
                settings.queue_entry_ttl = Duration::from_secs(required_u64(child)?)
            }
            "job-retention-secs" => settings.job_retention = Duration::from_secs(required_u64(child)?),
            _ => {}
        }
    }
    Ok(())
}

fn parse_orchestrator(node: &KdlNode, settings: &mut OrchestratorSettings) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "default-step-timeout-secs" => {
                settings.default_step_timeout = Duration::from_secs(required_u64(child)?)
            }
            "log-poll-interval-ms" => {
                settings.log_poll_interval = Duration::from_millis(required_u64(child)?)
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_cache(node: &KdlNode, settings: &mut CacheSettings) -> ConfigResult<()> {
    if let Some(enabled) = node.get("enabled").and_then(|v| v.as_bool()) {
        settings.enabled = enabled;
    }
    for child in children(node) {
        match child.name().value() {
            "retention-days" => {
                settings.retention = Duration::from_secs(required_u64(child)? * 24 * 60 * 60)
            }
            "enabled" => {
                settings.enabled = first_arg(child)
                    .and_then(|v| v.as_bool())
                    .ok_or_else(|| invalid(child, "expected a boolean"))?
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_sandbox(node: &KdlNode, settings: &mut SandboxSettings) -> ConfigResult<()> {
    if let Some(backend) = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
    {
        settings.backend = backend.to_string();
    }
    for child in children(node) {
        match child.name().value() {
            "image" => settings.image = required_string(child)?,
            "base-dir" => settings.base_dir = PathBuf::from(required_string(child)?),
            _ => {}
        }
    }
    if !matches!(settings.backend.as_str(), "local" | "docker") {
        return Err(ConfigError::InvalidValue {
            field: "sandbox".to_string(),
            message: format!("unknown backend: {}", settings.backend),
        });
    }
    Ok(())
}

// Helper functions for extracting values from KDL nodes

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|doc| doc.nodes())
}

fn first_arg(node: &KdlNode) -> Option<&kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn invalid(node: &KdlNode, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: node.name().value().to_string(),
        message: message.to_string(),
    }
}

fn required_u64(node: &KdlNode) -> ConfigResult<u64> {
    first_arg(node)
        .and_then(|v| v.as_integer())
        .and_then(|i| u64::try_from(i).ok())
        .ok_or_else(|| invalid(node, "expected a non-negative integer"))
}

fn required_string(node: &KdlNode) -> ConfigResult<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
        .ok_or_else(|| invalid(node, "expected a string"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_system_config("").unwrap();
        assert_eq!(config.scheduler.max_concurrent, 4);
        assert_eq!(
            config.orchestrator.default_step_timeout,
            Duration::from_secs(300)
        );
        assert_eq!(config.cache.retention, Duration::from_secs(30 * 86400));
        assert_eq!(config.sandbox.backend, "local");
    }

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            scheduler {
                max-concurrent 2
                poll-interval-ms 250
                queue-entry-ttl-secs 3600
                job-retention-secs 60
            }
            orchestrator {
                default-step-timeout-secs 120
                log-poll-interval-ms 500
            }
            cache enabled=#false {
                retention-days 7
            }
            storage {
                blob-dir "/var/lib/jobforge/blobs"
            }
            sandbox "docker" {
                image "rust:1.85"
            }
        "#;

        let config = parse_system_config(kdl).unwrap();
        assert_eq!(config.scheduler.max_concurrent, 2);
        assert_eq!(config.scheduler.poll_interval, Duration::from_millis(250));
        assert_eq!(config.scheduler.queue_entry_ttl, Duration::from_secs(3600));
        assert_eq!(config.scheduler.job_retention, Duration::from_secs(60));
        assert_eq!(
            config.orchestrator.default_step_timeout,
            Duration::from_secs(120)
        );
        assert_eq!(
            config.orchestrator.log_poll_interval,
            Duration::from_millis(500)
        );
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.retention, Duration::from_secs(7 * 86400));
        assert_eq!(
            config.storage.blob_dir,
            PathBuf::from("/var/lib/jobforge/blobs")
        );
        assert_eq!(config.sandbox.backend, "docker");
        assert_eq!(config.sandbox.image, "rust:1.85");
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = parse_system_config("scheduler { max-concurrent 0; }");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_wrong_value_type_rejected() {
        let result = parse_system_config(r#"scheduler { max-concurrent "four"; }"#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let result = parse_system_config(r#"sandbox "vm""#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
