//! Filesystem-backed blob store.
//!
//! Layout under the root directory:
//! - `data/<path>`: the blob body
//! - `meta/<path>.json`: the [`BlobObject`] descriptor

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use jobforge_core::{BlobObject, BlobStore, Error, Result};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Blob store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, path: &str) -> Result<PathBuf> {
        Ok(self.root.join("data").join(checked_relative(path)?))
    }

    fn meta_path(&self, path: &str) -> Result<PathBuf> {
        let relative = checked_relative(path)?;
        Ok(self
            .root
            .join("meta")
            .join(format!("{}.json", relative.display())))
    }
}

/// Reject absolute paths and parent traversal.
fn checked_relative(path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    let clean = candidate
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if path.is_empty() || !clean {
        return Err(Error::Storage(format!("invalid blob path: {}", path)));
    }
    Ok(candidate.to_path_buf())
}

fn io_error(context: &str, path: &Path, err: std::io::Error) -> Error {
    Error::Storage(format!("{} {}: {}", context, path.display(), err))
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error("create dir", parent, e))?;
    }
    Ok(())
}

fn collect_meta_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            collect_meta_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
    Ok(())
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, data: Bytes, metadata: HashMap<String, String>) -> Result<()> {
        let data_path = self.data_path(path)?;
        let meta_path = self.meta_path(path)?;
        ensure_parent(&data_path).await?;
        ensure_parent(&meta_path).await?;

        let object = BlobObject {
            path: path.to_string(),
            size: data.len() as u64,
            uploaded_at: Utc::now(),
            metadata,
        };

        tokio::fs::write(&data_path, &data)
            .await
            .map_err(|e| io_error("write", &data_path, e))?;
        tokio::fs::write(&meta_path, serde_json::to_vec_pretty(&object)?)
            .await
            .map_err(|e| io_error("write", &meta_path, e))?;

        debug!(path, size = object.size, "Stored blob");
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Bytes>> {
        let data_path = self.data_path(path)?;
        match tokio::fs::read(&data_path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", &data_path, e)),
        }
    }

    async fn head(&self, path: &str) -> Result<Option<BlobObject>> {
        let meta_path = self.meta_path(path)?;
        match tokio::fs::read(&meta_path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", &meta_path, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>> {
        let meta_root = self.root.join("meta");
        let files = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            collect_meta_files(&meta_root, &mut files).map(|_| files)
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
        .map_err(|e| Error::Storage(format!("list blobs: {}", e)))?;

        let mut objects = Vec::new();
        for file in files {
            let raw = tokio::fs::read(&file)
                .await
                .map_err(|e| io_error("read", &file, e))?;
            let object: BlobObject = serde_json::from_slice(&raw)?;
            if object.path.starts_with(prefix) {
                objects.push(object);
            }
        }
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        for file in [self.data_path(path)?, self.meta_path(path)?] {
            match tokio::fs::remove_file(&file).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("delete", &file, e)),
            }
        }
        Ok(())
    }
}
