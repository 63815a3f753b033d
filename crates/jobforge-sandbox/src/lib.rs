//! Execution sandboxes for jobforge.
//!
//! Provides sandbox implementations for running job steps:
//! - Local processes (development, dedicated machines)
//! - Docker containers

pub mod docker;
pub mod local;

pub use docker::{DockerSandbox, DockerSandboxProvider};
pub use local::{LocalSandbox, LocalSandboxProvider};
