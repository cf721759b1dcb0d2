//! # Data Directory Layout & Identity
//!
//! Single process-wide data directory with a flat, predictable shape:
//!
//! ```text
//! ~/.proobox/
//! ├── images/
//! │   ├── alpine-3.20.0.tar.gz
//! │   └── alpine-3.20.0.json
//! ├── containers/
//! │   └── <name>/
//! │       ├── rootfs/
//! │       ├── metadata.json
//! │       └── container.log
//! ├── cached_layers/
//! │   └── layer-<hex>/
//! └── config.json
//! ```
//!
//! Also home to the small identity helpers the rest of the engine shares:
//! container ids (64 hex chars from the OS RNG), generated names, version
//! normalization, host architecture mapping, and ISO-8601 timestamps.

use crate::constants::{
    CACHED_LAYERS_DIR, CONFIG_FILE, CONTAINERS_DIR, CONTAINER_ID_LEN, CONTAINER_LOG_FILE,
    CONTAINER_METADATA_FILE, DATA_DIR_NAME, IMAGES_DIR, LAYER_DIR_PREFIX, ROOTFS_DIR,
    SHORT_ID_LEN,
};
use crate::error::{Error, Result};
use chrono::Utc;
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};

/// Handle to the per-user data directory.
///
/// All stores (images, containers, layer cache, config) derive their paths
/// from one of these. Cloning is cheap; the handle carries only the base path.
#[derive(Debug, Clone)]
pub struct DataDir {
    base: PathBuf,
}

impl DataDir {
    /// Opens the default data directory (`~/.proobox`), creating the
    /// top-level layout if needed.
    pub fn new() -> Result<Self> {
        let base = match dirs::home_dir() {
            Some(home) => home.join(DATA_DIR_NAME),
            None => PathBuf::from(DATA_DIR_NAME),
        };
        Self::with_base(base)
    }

    /// Opens a data directory at an explicit base path.
    pub fn with_base(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        let dir = Self { base };
        fs::create_dir_all(dir.images_dir())?;
        fs::create_dir_all(dir.containers_dir())?;
        fs::create_dir_all(dir.cached_layers_dir())?;
        Ok(dir)
    }

    /// Returns the base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `images/` directory.
    pub fn images_dir(&self) -> PathBuf {
        self.base.join(IMAGES_DIR)
    }

    /// Artifact path for `repo` at an already-normalized `version`.
    pub fn image_artifact(&self, repo: &str, version: &str) -> PathBuf {
        self.images_dir().join(format!("{}-{}.tar.gz", repo, version))
    }

    /// Metadata path for `repo` at an already-normalized `version`.
    pub fn image_metadata(&self, repo: &str, version: &str) -> PathBuf {
        self.images_dir().join(format!("{}-{}.json", repo, version))
    }

    /// `containers/` directory.
    pub fn containers_dir(&self) -> PathBuf {
        self.base.join(CONTAINERS_DIR)
    }

    /// Directory for a named container.
    pub fn container_dir(&self, name: &str) -> PathBuf {
        self.containers_dir().join(name)
    }

    /// Rootfs directory for a named container.
    pub fn container_rootfs(&self, name: &str) -> PathBuf {
        self.container_dir(name).join(ROOTFS_DIR)
    }

    /// Metadata file for a named container.
    pub fn container_metadata(&self, name: &str) -> PathBuf {
        self.container_dir(name).join(CONTAINER_METADATA_FILE)
    }

    /// Log file for a named container.
    pub fn container_log(&self, name: &str) -> PathBuf {
        self.container_dir(name).join(CONTAINER_LOG_FILE)
    }

    /// `cached_layers/` directory.
    pub fn cached_layers_dir(&self) -> PathBuf {
        self.base.join(CACHED_LAYERS_DIR)
    }

    /// Directory for one cached layer.
    pub fn layer_dir(&self, key: &str) -> PathBuf {
        self.cached_layers_dir()
            .join(format!("{}{}", LAYER_DIR_PREFIX, key))
    }

    /// `config.json` path.
    pub fn config_path(&self) -> PathBuf {
        self.base.join(CONFIG_FILE)
    }
}

// =============================================================================
// Version Normalization
// =============================================================================

/// Normalizes a tag version to the on-disk form.
///
/// `N` becomes `N.0.0` and `N.M` becomes `N.M.0`, so that `alpine:3` and
/// `alpine:3.20` land on predictable filenames. Anything that is not one or
/// two dot-separated integers is passed through unchanged (`latest`,
/// `22.04.3`, `edge`, ...).
pub fn normalize_version(version: &str) -> String {
    let parts: Vec<&str> = version.split('.').collect();
    let all_numeric = !version.is_empty() && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));

    match parts.len() {
        1 if all_numeric => format!("{}.0.0", version),
        2 if all_numeric => format!("{}.0", version),
        _ => version.to_string(),
    }
}

// =============================================================================
// Architecture Mapping
// =============================================================================

/// Maps the host architecture to the distro artifact naming scheme.
///
/// Returns `arm64`, `armhf`, or `amd64`; any other host fails with
/// [`Error::ArchUnsupported`].
pub fn map_architecture() -> Result<&'static str> {
    map_architecture_of(std::env::consts::ARCH)
}

/// Maps an explicit architecture string; split out for testability.
pub fn map_architecture_of(arch: &str) -> Result<&'static str> {
    match arch {
        "aarch64" => Ok("arm64"),
        "arm" | "armv7" | "armv7l" => Ok("armhf"),
        "x86_64" => Ok("amd64"),
        other => Err(Error::ArchUnsupported {
            arch: other.to_string(),
        }),
    }
}

// =============================================================================
// Identifiers & Timestamps
// =============================================================================

/// Generates a fresh 64-hex container id from the OS RNG.
pub fn new_container_id() -> String {
    let mut bytes = [0u8; CONTAINER_ID_LEN / 2];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Returns the 12-character short form of an identifier.
pub fn short_id(id: &str) -> &str {
    &id[..SHORT_ID_LEN.min(id.len())]
}

/// Generates a container name of the form `<distro>-<8 random hex>`.
pub fn generate_name(distro: &str) -> String {
    let mut bytes = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("{}-{}", distro, hex::encode(bytes))
}

/// Current UTC time as ISO-8601 with millisecond precision.
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bare_major() {
        assert_eq!(normalize_version("3"), "3.0.0");
        assert_eq!(normalize_version("22"), "22.0.0");
    }

    #[test]
    fn normalize_major_minor() {
        assert_eq!(normalize_version("3.20"), "3.20.0");
        assert_eq!(normalize_version("22.04"), "22.04.0");
    }

    #[test]
    fn normalize_passthrough() {
        assert_eq!(normalize_version("latest"), "latest");
        assert_eq!(normalize_version("22.04.3"), "22.04.3");
        assert_eq!(normalize_version("edge"), "edge");
        assert_eq!(normalize_version("3.20-rc1"), "3.20-rc1");
    }

    #[test]
    fn container_ids_are_unique_hex() {
        let a = new_container_id();
        let b = new_container_id();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
