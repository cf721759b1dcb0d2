//! Constants for the container engine.
//!
//! Directory names, tracer invocation pieces, and timeouts are defined here
//! to ensure consistency and prevent magic strings throughout the codebase.

use std::time::Duration;

// =============================================================================
// Data Directory Layout
// =============================================================================

/// Name of the per-user data directory under `$HOME`.
pub const DATA_DIR_NAME: &str = ".proobox";

/// Subdirectory for image artifacts and metadata.
pub const IMAGES_DIR: &str = "images";

/// Subdirectory for container state.
pub const CONTAINERS_DIR: &str = "containers";

/// Subdirectory for the content-addressed layer cache.
pub const CACHED_LAYERS_DIR: &str = "cached_layers";

/// Prefix for layer cache directories (`layer-<hex>`).
pub const LAYER_DIR_PREFIX: &str = "layer-";

/// Backend configuration file name inside the data directory.
pub const CONFIG_FILE: &str = "config.json";

/// Container metadata file name inside a container directory.
pub const CONTAINER_METADATA_FILE: &str = "metadata.json";

/// Container log file name (detached stdout+stderr).
pub const CONTAINER_LOG_FILE: &str = "container.log";

/// Rootfs directory name inside a container directory.
pub const ROOTFS_DIR: &str = "rootfs";

// =============================================================================
// Tracer Invocation
// =============================================================================

/// The path-translating tracer binary.
pub const TRACER_BIN: &str = "proot";

/// Tracer flag: emulate symlink fidelity for filesystems that lack it.
pub const TRACER_FLAG_LINK2SYMLINK: &str = "--link2symlink";

/// Tracer flag: present the user as uid 0 inside the guest.
pub const TRACER_FLAG_ROOT_ID: &str = "-0";

/// Tracer flag introducing the redirected root.
pub const TRACER_FLAG_ROOT: &str = "-r";

/// Tracer flag introducing a bind mount.
pub const TRACER_FLAG_BIND: &str = "-b";

/// Tracer flag introducing the working directory.
pub const TRACER_FLAG_WORKDIR: &str = "-w";

/// Tracer flag: kill the guest when the tracer exits.
pub const TRACER_FLAG_KILL_ON_EXIT: &str = "--kill-on-exit";

/// Host paths bound into every container unchanged.
pub const FIXED_BINDS: &[&str] = &["/dev", "/proc", "/sys"];

/// Host storage roots bound into every container when present.
pub const STORAGE_BINDS: &[&str] = &["/sdcard", "/storage", "/mnt"];

/// Guest mount point for the host root.
pub const HOST_ROOTFS_MOUNT: &str = "/host-rootfs";

/// Guest mount point for the build context during COPY steps.
pub const BUILD_CONTEXT_MOUNT: &str = "/host_build_context";

/// Deterministic PATH handed to every guest.
pub const GUEST_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Guest home directory; the guest always runs as root.
pub const GUEST_HOME: &str = "/root";

/// Locale forced into the guest environment.
pub const GUEST_LANG: &str = "C.UTF-8";

// =============================================================================
// Timeouts
// =============================================================================

/// Default grace period between TERM and KILL when stopping a container.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait after the KILL escalation before declaring the stop failed.
pub const KILL_GRACE: Duration = Duration::from_secs(1);

/// Poll interval while waiting for signalled processes to disappear.
pub const LIVENESS_POLL: Duration = Duration::from_millis(250);

/// Timeout for registry downloads.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

// =============================================================================
// Registry Endpoints
// =============================================================================

/// Path prefix for user-registry downloads.
pub const REGISTRY_DOWNLOAD_PREFIX: &str = "api/download/proobox";

/// Path prefix for user-registry uploads.
pub const REGISTRY_UPLOAD_PREFIX: &str = "api/upload/proobox";

/// Alpine CDN used as the upstream mirror for tier-3 pulls.
pub const ALPINE_CDN: &str = "https://dl-cdn.alpinelinux.org/alpine";

/// Ubuntu base-image mirror used for tier-3 pulls.
pub const UBUNTU_CDN: &str = "http://cdimage.ubuntu.com/ubuntu-base/releases";

// =============================================================================
// Identifiers
// =============================================================================

/// Hex length of a full container id.
pub const CONTAINER_ID_LEN: usize = 64;

/// Hex length of a short id (containers and layer keys).
pub const SHORT_ID_LEN: usize = 12;

/// Minimum prefix length accepted when resolving a short id.
pub const MIN_SHORT_ID_LEN: usize = 4;

/// Fallback DNS servers written to every container's resolv.conf.
pub const FALLBACK_NAMESERVERS: &[&str] = &["8.8.8.8", "8.8.4.4"];
