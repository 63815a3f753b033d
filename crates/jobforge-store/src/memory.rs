//! In-memory stores.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use jobforge_core::{BlobObject, BlobStore, MetadataStore, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone)]
struct MetadataEntry {
    value: serde_json::Value,
    expires_at: Option<DateTime<Utc>>,
}

impl MetadataEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Key-value metadata store held in process memory.
///
/// Entries with a TTL are dropped lazily once expired.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    entries: Mutex<HashMap<String, MetadataEntry>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn put(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl);
        trace!(key, ?expires_at, "Metadata put");
        self.entries
            .lock()
            .insert(key.to_string(), MetadataEntry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| e.is_live(now));
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Blob store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, (Bytes, BlobObject)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, data: Bytes, metadata: HashMap<String, String>) -> Result<()> {
        let object = BlobObject {
            path: path.to_string(),
            size: data.len() as u64,
            uploaded_at: Utc::now(),
            metadata,
        };
        self.objects
            .lock()
            .insert(path.to_string(), (data, object));
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Bytes>> {
        Ok(self.objects.lock().get(path).map(|(data, _)| data.clone()))
    }

    async fn head(&self, path: &str) -> Result<Option<BlobObject>> {
        Ok(self.objects.lock().get(path).map(|(_, obj)| obj.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>> {
        let mut objects: Vec<BlobObject> = self
            .objects
            .lock()
            .values()
            .filter(|(_, obj)| obj.path.starts_with(prefix))
            .map(|(_, obj)| obj.clone())
            .collect();
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.lock().remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::MetadataStoreExt;

    #[tokio::test]
    async fn test_metadata_put_get_delete() {
        let store = MemoryMetadataStore::new();
        store
            .put("status:a", serde_json::json!({"status": "queued"}), None)
            .await
            .unwrap();

        let value = store.get("status:a").await.unwrap().unwrap();
        assert_eq!(value["status"], "queued");

        store.delete("status:a").await.unwrap();
        assert!(store.get("status:a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_metadata_list_by_prefix() {
        let store = MemoryMetadataStore::new();
        store.put("queue:1:1:a", serde_json::json!("a"), None).await.unwrap();
        store.put("queue:1:2:b", serde_json::json!("b"), None).await.unwrap();
        store.put("status:a", serde_json::json!({}), None).await.unwrap();

        let mut keys = store.list("queue:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["queue:1:1:a", "queue:1:2:b"]);
    }

    #[tokio::test]
    async fn test_metadata_ttl_expiry() {
        let store = MemoryMetadataStore::new();
        store
            .put("cache:k", serde_json::json!(1), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        store.put("cache:forever", serde_json::json!(2), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.get("cache:k").await.unwrap().is_none());
        assert_eq!(store.list("cache:").await.unwrap(), vec!["cache:forever"]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_typed_helpers() {
        let store = MemoryMetadataStore::new();
        store.put_json("job:x", &vec![1, 2, 3], None).await.unwrap();
        let back: Option<Vec<i32>> = store.get_json("job:x").await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));

        let missing: Option<Vec<i32>> = store.get_json("job:y").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_blob_put_head_list() {
        let store = MemoryBlobStore::new();
        let mut meta = HashMap::new();
        meta.insert("key".to_string(), "k1".to_string());
        store
            .put("cache/k1.tar.gz", Bytes::from_static(b"abc"), meta)
            .await
            .unwrap();
        store
            .put("snapshots/j/c/1.tar.gz", Bytes::from_static(b"x"), HashMap::new())
            .await
            .unwrap();

        let head = store.head("cache/k1.tar.gz").await.unwrap().unwrap();
        assert_eq!(head.size, 3);
        assert_eq!(head.metadata.get("key").map(String::as_str), Some("k1"));

        let listed = store.list("cache/").await.unwrap();
        assert_eq!(listed.len(), 1);

        store.delete("cache/k1.tar.gz").await.unwrap();
        assert!(store.head("cache/k1.tar.gz").await.unwrap().is_none());
        assert!(store.get("cache/k1.tar.gz").await.unwrap().is_none());
    }
}
