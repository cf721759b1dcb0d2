//! # Metadata Records & Atomic Store
//!
//! Strongly typed image and container metadata with an atomic write
//! protocol. The JSON shape on disk is part of the external interface and
//! is preserved bit-exactly across read/update/write cycles:
//!
//! ```json
//! {
//!   "Id": "4f2c…", "Name": "web",
//!   "Image": { "Name": "alpine:3.20.0", "Id": "9b1d…" },
//!   "State": { "Status": "running", "Running": true, ... },
//!   "Config": { "Hostname": "web", "User": "root", ... },
//!   "HostConfig": { "Binds": [], "AutoRemove": false },
//!   "NetworkSettings": { "IPAddress": "", "Ports": {} },
//!   "Paths": { "RootfsPath": "…", "LogFile": null, "ImagePath": "…" }
//! }
//! ```
//!
//! ## Atomic Writes
//!
//! Every write serializes to a uniquely named sibling temp file and renames
//! it into place. If the rename fails (cross-device link), the store falls
//! back to copy+unlink; if that fails too the temp file is left behind for
//! inspection and the error surfaces as `MetadataWriteFailed`.
//!
//! ## Resolution
//!
//! `resolve` accepts a container name or a 4–12 hex id prefix. A prefix that
//! matches more than one stored id is an error, never a guess.

use crate::constants::{MIN_SHORT_ID_LEN, SHORT_ID_LEN};
use crate::error::{Error, Result};
use crate::paths::DataDir;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

// =============================================================================
// Container Status
// =============================================================================

/// Lifecycle status stored in container metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Rootfs exists, no process was ever started.
    Created,
    /// A tracer process for this rootfs has been observed.
    Running,
    /// The guest exited; exit code recorded.
    Exited,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

// =============================================================================
// Container Metadata
// =============================================================================

/// Runtime state block of a container record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    #[serde(rename = "Status")]
    pub status: ContainerStatus,
    #[serde(rename = "Running")]
    pub running: bool,
    /// Whether the container was originally launched detached.
    #[serde(rename = "DetachedOriginal")]
    pub detached_original: bool,
    /// Whether the container was originally launched interactive.
    #[serde(rename = "InteractiveOriginal")]
    pub interactive_original: bool,
    #[serde(rename = "StartedAt")]
    pub started_at: String,
    #[serde(rename = "FinishedAt")]
    pub finished_at: String,
    #[serde(rename = "ExitCode")]
    pub exit_code: i32,
}

/// Source image reference block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRef {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Id")]
    pub id: String,
}

/// Launch configuration block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Hostname")]
    pub hostname: String,
    #[serde(rename = "Domainname", default)]
    pub domainname: String,
    #[serde(rename = "User", default = "default_user")]
    pub user: String,
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
    /// `null` when the image supplies no default and the CLI gave none.
    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "WorkingDir", default = "default_workdir")]
    pub working_dir: String,
    /// Always `null` in this design; kept for shape compatibility.
    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Option<Vec<String>>,
    /// Always `null` in this design; kept for shape compatibility.
    #[serde(rename = "Healthcheck", default)]
    pub healthcheck: Option<Value>,
}

/// Host configuration block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(rename = "Binds", default)]
    pub binds: Vec<String>,
    #[serde(rename = "AutoRemove", default)]
    pub auto_remove: bool,
}

/// Network settings block. Empty in this design: the guest shares the host
/// network view through the tracer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    #[serde(rename = "Ports", default)]
    pub ports: BTreeMap<String, Value>,
}

/// Filesystem paths block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerPaths {
    #[serde(rename = "RootfsPath")]
    pub rootfs_path: String,
    #[serde(rename = "LogFile")]
    pub log_file: Option<String>,
    #[serde(rename = "ImagePath")]
    pub image_path: String,
}

/// Full container metadata record; source of truth for container state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerMetadata {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Image")]
    pub image: ImageRef,
    #[serde(rename = "State")]
    pub state: ContainerState,
    #[serde(rename = "Config")]
    pub config: ContainerConfig,
    #[serde(rename = "HostConfig")]
    pub host_config: HostConfig,
    #[serde(rename = "Mounts", default)]
    pub mounts: Vec<Value>,
    #[serde(rename = "NetworkSettings", default)]
    pub network_settings: NetworkSettings,
    #[serde(rename = "Paths")]
    pub paths: ContainerPaths,
}

// =============================================================================
// Image Metadata
// =============================================================================

/// Container defaults carried by an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageContainerConfig {
    /// Default command, or `null` when the image defines none.
    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default = "default_workdir")]
    pub working_dir: String,
    /// Always `null` in this design; kept for shape compatibility.
    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
}

impl Default for ImageContainerConfig {
    fn default() -> Self {
        Self {
            cmd: None,
            working_dir: default_workdir(),
            entrypoint: None,
            env: Vec::new(),
        }
    }
}

/// Paths block of an image record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePaths {
    #[serde(rename = "ImagePath")]
    pub image_path: String,
}

/// Full image metadata record; the `<repo>-<version>.json` companion of the
/// artifact is the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageMetadata {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Created")]
    pub created: String,
    #[serde(rename = "Size")]
    pub size: u64,
    /// Directory-content hash used as the FROM-layer cache key. Opaque; not
    /// a byte count.
    #[serde(rename = "VirtualSize")]
    pub virtual_size: String,
    #[serde(rename = "ContainerConfig", default)]
    pub container_config: ImageContainerConfig,
    #[serde(rename = "Os")]
    pub os: String,
    #[serde(rename = "Architecture")]
    pub architecture: String,
    #[serde(rename = "Paths")]
    pub paths: ImagePaths,
}

fn default_workdir() -> String {
    "/root".to_string()
}

fn default_user() -> String {
    "root".to_string()
}

// =============================================================================
// Metadata Store
// =============================================================================

/// Reads and writes metadata records under a [`DataDir`].
#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: DataDir,
}

impl MetadataStore {
    /// Creates a store over the given data directory.
    pub fn new(dir: DataDir) -> Self {
        Self { dir }
    }

    /// Returns the underlying data directory.
    pub fn data_dir(&self) -> &DataDir {
        &self.dir
    }

    /// Reads image metadata for `repo` at an already-normalized `version`.
    pub fn read_image(&self, repo: &str, version: &str) -> Result<ImageMetadata> {
        let path = self.dir.image_metadata(repo, version);
        read_json(&path)
    }

    /// Writes image metadata atomically.
    pub fn write_image(&self, repo: &str, version: &str, meta: &ImageMetadata) -> Result<()> {
        let path = self.dir.image_metadata(repo, version);
        write_json_atomic(&path, meta)
    }

    /// Reads container metadata by exact name.
    pub fn read_container(&self, name: &str) -> Result<ContainerMetadata> {
        let path = self.dir.container_metadata(name);
        if !path.exists() {
            return Err(Error::ContainerNotFound(name.to_string()));
        }
        read_json(&path)
    }

    /// Writes container metadata atomically.
    pub fn write_container(&self, meta: &ContainerMetadata) -> Result<()> {
        let path = self.dir.container_metadata(&meta.name);
        write_json_atomic(&path, meta)
    }

    /// Updates only the state block of a container record.
    ///
    /// Fields passed as `None` keep their stored value, so callers can flip
    /// `running` without touching timestamps and vice versa.
    pub fn update_state(
        &self,
        name: &str,
        status: ContainerStatus,
        running: bool,
        finished_at: Option<String>,
        exit_code: Option<i32>,
    ) -> Result<()> {
        let mut meta = self.read_container(name)?;
        meta.state.status = status;
        meta.state.running = running;
        if let Some(ts) = finished_at {
            meta.state.finished_at = ts;
        }
        if let Some(code) = exit_code {
            meta.state.exit_code = code;
        }
        self.write_container(&meta)
    }

    /// Resolves a container spec (name or 4–12 hex id prefix) to its
    /// metadata record.
    pub fn resolve(&self, spec: &str) -> Result<ContainerMetadata> {
        // Exact name wins outright.
        if self.dir.container_metadata(spec).exists() {
            return self.read_container(spec);
        }

        if !is_id_prefix(spec) {
            return Err(Error::ContainerNotFound(spec.to_string()));
        }

        let mut matches = Vec::new();
        for meta in self.list_containers()? {
            if meta.id.starts_with(spec) {
                matches.push(meta);
            }
        }

        match matches.len() {
            0 => Err(Error::ContainerNotFound(spec.to_string())),
            1 => Ok(matches.remove(0)),
            n => Err(Error::Ambiguous {
                prefix: spec.to_string(),
                count: n,
            }),
        }
    }

    /// Lists every container record under `containers/`.
    ///
    /// Directories without a readable metadata file are skipped with a
    /// warning rather than failing the whole listing.
    pub fn list_containers(&self) -> Result<Vec<ContainerMetadata>> {
        let mut out = Vec::new();
        let dir = self.dir.containers_dir();
        if !dir.exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match self.read_container(&name) {
                Ok(meta) => out.push(meta),
                Err(e) => warn!("skipping container '{}': {}", name, e),
            }
        }
        Ok(out)
    }
}

/// True if `spec` could be a short-id prefix (4–12 hex chars).
fn is_id_prefix(spec: &str) -> bool {
    spec.len() >= MIN_SHORT_ID_LEN
        && spec.len() <= SHORT_ID_LEN
        && spec.chars().all(|c| c.is_ascii_hexdigit())
}

// =============================================================================
// Atomic JSON I/O
// =============================================================================

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|e| Error::MetadataMalformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|e| Error::MetadataMalformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Serializes `value` next to `path` and renames into place.
///
/// Falls back to copy+unlink when rename fails across devices; leaves the
/// temp file behind if both fail so the partial write is inspectable.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(value)?;
    let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
    fs::write(&temp_path, &content).map_err(|e| Error::MetadataWriteFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    match fs::rename(&temp_path, path) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(
                "rename failed for {} ({}), trying copy fallback",
                path.display(),
                rename_err
            );
            match fs::copy(&temp_path, path) {
                Ok(_) => {
                    let _ = fs::remove_file(&temp_path);
                    Ok(())
                }
                Err(copy_err) => Err(Error::MetadataWriteFailed {
                    path: path.to_path_buf(),
                    reason: format!("rename: {}; copy: {}", rename_err, copy_err),
                }),
            }
        }
    }
}
