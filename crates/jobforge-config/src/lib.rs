//! KDL configuration parsing for jobforge.
//!
//! This crate handles parsing of:
//! - Job definitions (`job.kdl`)
//! - System configuration (`jobforge.kdl`)
//! - Variable interpolation in step commands

pub mod error;
pub mod job;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use job::{load_jobs, parse_job, parse_jobs};
pub use system::{
    CacheSettings, OrchestratorSettings, SandboxSettings, SchedulerSettings, StorageSettings,
    SystemConfig, load_system_config, parse_system_config,
};
pub use variables::{GitContext, JobContext, StepContext, VariableContext};
