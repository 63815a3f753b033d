//! Dependency cache records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata record of a saved dependency cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheKey {
    /// `repo-commit[-manifestHash]`.
    pub key: String,
    /// Directories archived into the bundle.
    pub paths: Vec<String>,
    pub last_used: DateTime<Utc>,
    /// Bundle size in bytes.
    pub size: u64,
}

/// A cache bundle as found in blob storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub paths: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}
