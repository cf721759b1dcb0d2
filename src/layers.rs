//! # Content-Addressed Layer Cache
//!
//! Stores rootfs snapshots by a composed hash chain so that rebuilding an
//! unchanged recipe reuses every step instead of re-executing it.
//!
//! ## Storage Model
//!
//! ```text
//! ~/.proobox/cached_layers/
//! ├── layer-a1b2c3d4e5f6/     (FROM layer: extracted base image)
//! └── layer-0f9e8d7c6b5a/     (step layer: rootfs after one build step)
//! ```
//!
//! A FROM layer is keyed by the hash of the base image tag. A step layer is
//! keyed by the hash of the canonical directive text (plus the hash of the
//! copied source bytes for COPY), chained onto the previous layer's key, so
//! any change to a step invalidates everything after it.
//!
//! ## Failure Model
//!
//! `lookup` treats only a non-empty directory as a hit. `fill` is
//! best-effort: a snapshot that cannot be completed is logged and discarded,
//! never surfaced to the build.

use crate::error::Result;
use crate::paths::DataDir;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Hex length of a layer key component.
const KEY_LEN: usize = 12;

/// Content-addressed layer cache under `cached_layers/`.
#[derive(Debug, Clone)]
pub struct LayerCache {
    dir: DataDir,
}

impl LayerCache {
    /// Creates a cache over the given data directory.
    pub fn new(dir: DataDir) -> Self {
        Self { dir }
    }

    /// Looks up a layer by key. A hit requires the directory to exist and
    /// contain at least one entry.
    pub fn lookup(&self, key: &str) -> Option<PathBuf> {
        let path = self.dir.layer_dir(key);
        match fs::read_dir(&path) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    debug!("layer cache hit: {}", key);
                    Some(path)
                } else {
                    None
                }
            }
            Err(_) => None,
        }
    }

    /// Snapshots `src` into the cache under `key`.
    ///
    /// Best-effort: a partial snapshot is removed and the failure downgraded
    /// to a warning, leaving the cache without that entry.
    pub fn fill(&self, key: &str, src: &Path) {
        let dst = self.dir.layer_dir(key);
        if dst.exists() {
            debug!("layer {} already cached", key);
            return;
        }
        if let Err(e) = copy_dir_recursive(src, &dst) {
            warn!("failed to cache layer {}: {}", key, e);
            let _ = fs::remove_dir_all(&dst);
        }
    }

    /// Removes a cached layer if present.
    pub fn remove(&self, key: &str) {
        let path = self.dir.layer_dir(key);
        if path.exists() {
            if let Err(e) = fs::remove_dir_all(&path) {
                warn!("failed to remove cached layer {}: {}", key, e);
            }
        }
    }
}

// =============================================================================
// Key Derivation
// =============================================================================

/// First 12 hex chars of the SHA-256 of `data`.
pub fn short_hash(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(digest)[..KEY_LEN].to_string()
}

/// Cache key of the FROM layer for a base image tag.
pub fn from_layer_key(base_tag: &str) -> String {
    short_hash(base_tag.as_bytes())
}

/// Per-step key component: the directive line hash, extended with the
/// source-content hash for COPY so edited files invalidate the step.
pub fn step_key(line: &str, copy_source: Option<&[u8]>) -> String {
    match copy_source {
        Some(bytes) => format!("{}{}", short_hash(line.as_bytes()), short_hash(bytes)),
        None => short_hash(line.as_bytes()),
    }
}

/// Chains a step key onto the previous layer key.
pub fn chain_key(previous: &str, step: &str) -> String {
    short_hash(format!("{}-{}", previous, step).as_bytes())
}

// =============================================================================
// Recursive Copy
// =============================================================================

/// Recursively copies a directory tree, preserving permissions and
/// recreating symlinks rather than following them.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    if let Ok(meta) = fs::metadata(src) {
        let _ = fs::set_permissions(dst, meta.permissions());
    }

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = fs::read_link(&from)?;
            if to.exists() || to.symlink_metadata().is_ok() {
                let _ = fs::remove_file(&to);
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &to)?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else {
            // fs::copy preserves the permission bits.
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}
