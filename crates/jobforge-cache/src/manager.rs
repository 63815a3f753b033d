//! Cache save and restore through the blob store.
//!
//! Bundles are gzip tarballs built and unpacked inside the job's sandbox, so
//! the manager only ever moves opaque bytes. Paths inside a bundle keep the
//! form they were saved with: relative ones land under the checkout root,
//! absolute ones (including `~/` expanded by the shell) at the same place.

use chrono::{DateTime, Utc};
use jobforge_core::keys::{
    CACHE_BLOB_PREFIX, cache_blob_path, cache_key_from_blob_path, cache_meta_key,
};
use jobforge_core::sandbox::shell_quote;
use jobforge_core::{
    BlobObject, BlobStore, CacheEntry, CacheKey, Error, ExecOptions, MetadataStore,
    MetadataStoreExt, Result, Sandbox,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default lifetime of `cache:{key}` metadata records.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Saves and restores dependency directories for jobs.
#[derive(Clone)]
pub struct CacheManager {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    retention: Duration,
}

impl CacheManager {
    pub fn new(blobs: Arc<dyn BlobStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            blobs,
            metadata,
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// See [`crate::generate_cache_key`].
    pub async fn generate_cache_key(
        &self,
        repo: &str,
        commit: &str,
        manifests: &[String],
        sandbox: Option<&dyn Sandbox>,
    ) -> String {
        crate::key::generate_cache_key(repo, commit, manifests, sandbox).await
    }

    /// Archive the existing `paths` and upload them under `key`.
    ///
    /// Paths that do not exist are left out. Fails with
    /// [`Error::NoCacheableDirectories`] when none exist.
    pub async fn save_cache(
        &self,
        key: &str,
        paths: &[String],
        sandbox: &dyn Sandbox,
    ) -> Result<CacheKey> {
        let mut existing = Vec::new();
        for path in paths {
            if sandbox.exists(path).await? {
                existing.push(path.clone());
            } else {
                debug!(cache_key = %key, path = %path, "Cache path missing, skipping");
            }
        }
        if existing.is_empty() {
            return Err(Error::NoCacheableDirectories(paths.to_vec()));
        }

        let bundle = bundle_path(key);
        let quoted: Vec<String> = existing.iter().map(|p| shell_quote(p)).collect();
        let command = format!("tar -czPf {} {}", shell_quote(&bundle), quoted.join(" "));
        let output = sandbox
            .exec(
                &command,
                ExecOptions::in_dir(sandbox.workspace_root()),
                CancellationToken::new(),
            )
            .await?;
        if !output.success() {
            remove_bundle(sandbox, &bundle).await;
            return Err(Error::Sandbox(format!(
                "archiving cache failed (exit {}): {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        let data = sandbox.read_file(&bundle).await;
        remove_bundle(sandbox, &bundle).await;
        let data = data?;
        let size = data.len() as u64;
        let now = Utc::now();

        let mut meta = HashMap::new();
        meta.insert("key".to_string(), key.to_string());
        meta.insert("paths".to_string(), serde_json::to_string(&existing)?);
        meta.insert("timestamp".to_string(), now.to_rfc3339());
        meta.insert("size".to_string(), size.to_string());
        self.blobs.put(&cache_blob_path(key), data, meta).await?;

        let record = CacheKey {
            key: key.to_string(),
            paths: existing,
            last_used: now,
            size,
        };
        self.metadata
            .put_json(&cache_meta_key(key), &record, Some(self.retention))
            .await?;

        info!(cache_key = %key, size, paths = record.paths.len(), "Saved cache");
        Ok(record)
    }

    /// Restore the bundle stored under `key` into the sandbox.
    ///
    /// Returns `Ok(false)` on a miss. A storage failure while looking the
    /// bundle up counts as a miss.
    pub async fn restore_cache(&self, key: &str, sandbox: &dyn Sandbox) -> Result<bool> {
        let blob_path = cache_blob_path(key);
        let head = match self.blobs.head(&blob_path).await {
            Ok(Some(head)) => head,
            Ok(None) => {
                debug!(cache_key = %key, "Cache miss");
                return Ok(false);
            }
            Err(e) => {
                warn!(cache_key = %key, error = %e, "Cache lookup failed, treating as miss");
                return Ok(false);
            }
        };
        let data = match self.blobs.get(&blob_path).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                debug!(cache_key = %key, "Cache bundle vanished after lookup");
                return Ok(false);
            }
            Err(e) => {
                warn!(cache_key = %key, error = %e, "Cache download failed, treating as miss");
                return Ok(false);
            }
        };

        let bundle = bundle_path(key);
        sandbox.write_file(&bundle, data).await?;
        let output = sandbox
            .exec(
                &format!("tar -xzPf {}", shell_quote(&bundle)),
                ExecOptions::in_dir(sandbox.workspace_root()),
                CancellationToken::new(),
            )
            .await;
        remove_bundle(sandbox, &bundle).await;
        let output = output?;
        if !output.success() {
            return Err(Error::Sandbox(format!(
                "extracting cache failed (exit {}): {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        self.touch(key, &head).await;
        info!(cache_key = %key, size = head.size, "Restored cache");
        Ok(true)
    }

    /// Whether a bundle is stored under `key`.
    pub async fn cache_exists(&self, key: &str) -> Result<bool> {
        Ok(self.blobs.head(&cache_blob_path(key)).await?.is_some())
    }

    /// Every stored bundle with its metadata.
    pub async fn list_caches(&self) -> Result<Vec<CacheEntry>> {
        let objects = self.blobs.list(CACHE_BLOB_PREFIX).await?;
        Ok(objects.into_iter().filter_map(entry_from_object).collect())
    }

    /// Delete bundles and metadata saved more than `max_age` ago.
    pub async fn prune_caches(&self, max_age: Duration) -> Result<usize> {
        let max_age =
            chrono::TimeDelta::from_std(max_age).map_err(|e| Error::Validation(e.to_string()))?;
        let cutoff = Utc::now() - max_age;

        let mut pruned = 0;
        for entry in self.list_caches().await? {
            if entry.created_at >= cutoff {
                continue;
            }
            self.blobs.delete(&cache_blob_path(&entry.key)).await?;
            self.metadata.delete(&cache_meta_key(&entry.key)).await?;
            debug!(cache_key = %entry.key, "Pruned cache");
            pruned += 1;
        }

        if pruned > 0 {
            info!(count = pruned, "Pruned caches");
        }
        Ok(pruned)
    }

    /// The `cache:{key}` record, if still retained.
    pub async fn get_cache_key(&self, key: &str) -> Result<Option<CacheKey>> {
        self.metadata.get_json(&cache_meta_key(key)).await
    }

    /// Refresh `lastUsed` and the retention window after a hit.
    async fn touch(&self, key: &str, head: &BlobObject) {
        let record = match self.get_cache_key(key).await {
            Ok(Some(mut record)) => {
                record.last_used = Utc::now();
                record
            }
            Ok(None) | Err(_) => {
                let entry = entry_from_object(head.clone());
                CacheKey {
                    key: key.to_string(),
                    paths: entry.map(|e| e.paths).unwrap_or_default(),
                    last_used: Utc::now(),
                    size: head.size,
                }
            }
        };
        if let Err(e) = self
            .metadata
            .put_json(&cache_meta_key(key), &record, Some(self.retention))
            .await
        {
            warn!(cache_key = %key, error = %e, "Failed to refresh cache metadata");
        }
    }
}

/// Scratch location of a bundle inside the sandbox.
fn bundle_path(key: &str) -> String {
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    format!("/tmp/jobforge-cache-{}.tar.gz", &digest[..16])
}

async fn remove_bundle(sandbox: &dyn Sandbox, bundle: &str) {
    let result = sandbox
        .exec(
            &format!("rm -f {}", shell_quote(bundle)),
            ExecOptions::default(),
            CancellationToken::new(),
        )
        .await;
    if let Err(e) = result {
        debug!(bundle, error = %e, "Failed to remove cache bundle");
    }
}

fn entry_from_object(object: BlobObject) -> Option<CacheEntry> {
    let key = match object.metadata.get("key") {
        Some(key) => key.clone(),
        None => cache_key_from_blob_path(&object.path)?.to_string(),
    };
    let paths = object
        .metadata
        .get("paths")
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    let created_at = object
        .metadata
        .get("timestamp")
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(object.uploaded_at);
    let size = object
        .metadata
        .get("size")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(object.size);

    Some(CacheEntry {
        key,
        paths,
        created_at,
        size,
    })
}
