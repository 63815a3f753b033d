//! Storage abstractions: key-value metadata and blobs.
//!
//! Both stores are shared between schedulers and only eventually consistent.
//! Neither offers compare-and-swap; callers must tolerate duplicate writes.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;

use crate::Result;

/// Key-value store for JSON metadata.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Store a value. Expired entries disappear from `get` and `list`.
    async fn put(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, in no particular order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Typed helpers over [`MetadataStore`].
#[async_trait]
pub trait MetadataStoreExt: MetadataStore {
    async fn put_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.put(key, serde_json::to_value(value)?, ttl).await
    }

    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

impl<S: MetadataStore + ?Sized> MetadataStoreExt for S {}

/// A stored blob's descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobObject {
    pub path: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

/// Object storage keyed by path.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, data: Bytes, metadata: HashMap<String, String>) -> Result<()>;

    async fn get(&self, path: &str) -> Result<Option<Bytes>>;

    /// Descriptor without the body, `None` when absent.
    async fn head(&self, path: &str) -> Result<Option<BlobObject>>;

    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>>;

    async fn delete(&self, path: &str) -> Result<()>;
}
