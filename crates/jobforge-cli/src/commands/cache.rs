//! Cache commands.

use anyhow::{Context, Result};
use jobforge_cache::CacheManager;
use jobforge_config::SystemConfig;
use jobforge_core::Sandbox;
use jobforge_sandbox::LocalSandbox;
use jobforge_store::{FsBlobStore, MemoryMetadataStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub fn manager(config: &SystemConfig) -> CacheManager {
    CacheManager::new(
        Arc::new(FsBlobStore::new(config.storage.blob_dir.clone())),
        Arc::new(MemoryMetadataStore::new()),
    )
    .with_retention(config.cache.retention)
}

pub async fn key(repo: &str, commit: &str, manifests: &[String], dir: Option<PathBuf>) -> Result<()> {
    let sandbox = dir.map(LocalSandbox::new);
    let key = jobforge_cache::generate_cache_key(
        repo,
        commit,
        manifests,
        sandbox.as_ref().map(|s| s as &dyn Sandbox),
    )
    .await;
    println!("{}", key);
    Ok(())
}

pub async fn list(config: &SystemConfig) -> Result<()> {
    let mut caches = manager(config)
        .list_caches()
        .await
        .context("Failed to list caches")?;
    if caches.is_empty() {
        println!("No caches stored in {}", config.storage.blob_dir.display());
        return Ok(());
    }

    caches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    for cache in caches {
        println!(
            "{}  {:>10}  {}  {}",
            cache.created_at.format("%Y-%m-%d %H:%M:%S"),
            cache.size,
            cache.key,
            cache.paths.join(",")
        );
    }
    Ok(())
}

pub async fn prune(config: &SystemConfig, days: Option<u64>) -> Result<()> {
    let max_age = days
        .map(|d| Duration::from_secs(d * 24 * 60 * 60))
        .unwrap_or(config.cache.retention);
    let pruned = manager(config)
        .prune_caches(max_age)
        .await
        .context("Failed to prune caches")?;
    println!("Pruned {} cache(s)", pruned);
    Ok(())
}
