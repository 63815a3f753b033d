//! Cache key derivation.

use jobforge_core::Sandbox;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Hex characters of the manifest digest kept in a key.
pub const HASH_LEN: usize = 16;

/// Derive the cache key for a build.
///
/// The base key is `repo-commit`. When a sandbox is given, each manifest is
/// read in the order listed and the concatenated contents are hashed; the
/// first [`HASH_LEN`] hex characters of the SHA-256 digest are appended as
/// `-{hash}`. Unreadable manifests are skipped. If none could be read, the
/// base key is returned unchanged.
pub async fn generate_cache_key(
    repo: &str,
    commit: &str,
    manifests: &[String],
    sandbox: Option<&dyn Sandbox>,
) -> String {
    let base = format!("{}-{}", repo, commit);
    let Some(sandbox) = sandbox else {
        return base;
    };
    if manifests.is_empty() {
        return base;
    }

    let mut hasher = Sha256::new();
    let mut read_any = false;
    for manifest in manifests {
        match sandbox.read_file(manifest).await {
            Ok(content) => {
                hasher.update(&content);
                read_any = true;
            }
            Err(e) => debug!(manifest = %manifest, error = %e, "Skipping unreadable manifest"),
        }
    }

    if !read_any {
        return base;
    }

    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", base, &digest[..HASH_LEN])
}
