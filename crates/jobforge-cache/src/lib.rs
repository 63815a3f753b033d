//! Dependency cache management for jobforge.
//!
//! Derives reproducible cache keys from build identity plus manifest contents
//! and moves dependency directories between a job's sandbox and blob storage.

pub mod ecosystem;
pub mod key;
pub mod manager;

pub use ecosystem::{Ecosystem, ECOSYSTEMS, all_default_paths, detect_cache_paths};
pub use key::generate_cache_key;
pub use manager::CacheManager;
