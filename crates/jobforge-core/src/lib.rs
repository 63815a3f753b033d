//! Core domain types and traits for jobforge.
//!
//! This crate contains:
//! - Job, step and status records
//! - The error taxonomy shared by all crates
//! - Collaborator traits (sandbox, metadata store, blob store, state manager)
//! - Persisted key shapes

pub mod cache;
pub mod error;
pub mod id;
pub mod job;
pub mod keys;
pub mod sandbox;
pub mod snapshot;
pub mod status;
pub mod store;

pub use cache::{CacheEntry, CacheKey};
pub use error::{Error, Result};
pub use id::JobId;
pub use job::{Job, Step};
pub use sandbox::{ExecOptions, ExecOutput, Sandbox, SandboxProvider};
pub use snapshot::{StateManager, WorkspaceSnapshot};
pub use status::{JobState, JobStatus, StepResult, StepState};
pub use store::{BlobObject, BlobStore, MetadataStore, MetadataStoreExt};
