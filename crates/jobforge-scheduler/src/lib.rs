//! Job scheduling for jobforge.
//!
//! Holds the priority queue, the orchestrator that runs a job's steps inside
//! a sandbox, and the worker loop that dispatches queued jobs.

pub mod logs;
pub mod orchestrator;
pub mod queue;
pub mod worker;

#[cfg(test)]
mod testing;

pub use logs::stream_job_logs;
pub use orchestrator::{Orchestrator, OrchestratorConfig, TIMEOUT_EXIT_CODE};
pub use queue::{JobQueue, QueueConfig};
pub use worker::Worker;
