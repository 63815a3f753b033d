//! Storage backends for jobforge.
//!
//! Production deployments plug in their own key-value and object stores; the
//! implementations here back local runs and tests:
//! - [`MemoryMetadataStore`]: key-value metadata with TTL expiry
//! - [`MemoryBlobStore`]: blobs held in memory
//! - [`FsBlobStore`]: blobs on the local filesystem with JSON sidecar metadata

pub mod fs;
pub mod memory;

pub use fs::FsBlobStore;
pub use memory::{MemoryBlobStore, MemoryMetadataStore};
