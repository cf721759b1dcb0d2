//! # Rootfs Assembly
//!
//! Materializes a container's root filesystem from a base image. The fast
//! path copies the extracted FROM-layer out of the cache; the slow path
//! extracts the image artifact and fills the cache for next time.
//!
//! Extraction deliberately skips `dev/`, `proc/`, and `sys/` (those are
//! bind-mounted from the host at run time) and never applies uid/gid from
//! the archive, since the engine runs unprivileged.
//!
//! Every assembled rootfs gets the special directories the tracer expects
//! (`dev proc sys tmp run etc`) and a `resolv.conf` with public fallback
//! nameservers, because the guest cannot rely on the host's resolver
//! configuration surviving path translation.

use crate::constants::FALLBACK_NAMESERVERS;
use crate::error::{Error, Result};
use crate::layers::{self, LayerCache};
use crate::paths::DataDir;
use flate2::read::GzDecoder;
use std::fs;
use std::path::Path;
use tar::Archive;
use tracing::{debug, info};

/// Archive prefixes never extracted into a rootfs.
const EXCLUDED_PREFIXES: &[&str] = &["dev/", "proc/", "sys/"];

/// Directories guaranteed to exist in every rootfs, with their modes.
const SPECIAL_DIRS: &[(&str, u32)] = &[
    ("dev", 0o755),
    ("proc", 0o755),
    ("sys", 0o755),
    ("tmp", 0o1777),
    ("run", 0o755),
    ("etc", 0o755),
];

/// Materializes `rootfs` from the image artifact for `base_tag`.
///
/// Uses the FROM-layer cache when populated; otherwise extracts the
/// artifact and snapshots the result into the cache (best-effort).
pub fn assemble(dir: &DataDir, artifact: &Path, base_tag: &str, rootfs: &Path) -> Result<()> {
    let cache = LayerCache::new(dir.clone());
    let key = layers::from_layer_key(base_tag);

    fs::create_dir_all(rootfs)?;

    if let Some(cached) = cache.lookup(&key) {
        info!("assembling rootfs for {} from cached layer", base_tag);
        layers::copy_dir_recursive(&cached, rootfs)?;
    } else {
        info!("extracting {} into {}", artifact.display(), rootfs.display());
        extract_artifact(artifact, rootfs)?;
        cache.fill(&key, rootfs);
    }

    prepare_rootfs(rootfs)?;
    Ok(())
}

/// Extracts a gzipped rootfs tarball, skipping the excluded prefixes and
/// dropping archive ownership.
pub fn extract_artifact(artifact: &Path, rootfs: &Path) -> Result<()> {
    let file = fs::File::open(artifact).map_err(|e| Error::ExtractFailed {
        archive: artifact.to_path_buf(),
        reason: e.to_string(),
    })?;
    let decoder = GzDecoder::new(file);
    let mut archive = Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(false);

    let entries = archive.entries().map_err(|e| Error::ExtractFailed {
        archive: artifact.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut count = 0usize;
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::ExtractFailed {
            archive: artifact.to_path_buf(),
            reason: e.to_string(),
        })?;

        let skip = {
            let path = entry.path().map_err(|e| Error::ExtractFailed {
                archive: artifact.to_path_buf(),
                reason: e.to_string(),
            })?;
            let rel = path.to_string_lossy();
            let rel = rel.trim_start_matches("./");
            EXCLUDED_PREFIXES.iter().any(|p| rel.starts_with(p))
        };
        if skip {
            continue;
        }

        // unpack_in refuses paths escaping the destination.
        let unpacked = entry.unpack_in(rootfs).map_err(|e| Error::ExtractFailed {
            archive: artifact.to_path_buf(),
            reason: e.to_string(),
        })?;
        if unpacked {
            count += 1;
        }
    }

    debug!("extracted {} entries from {}", count, artifact.display());
    Ok(())
}

/// Ensures the special directories and DNS configuration are in place.
fn prepare_rootfs(rootfs: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    for (name, mode) in SPECIAL_DIRS {
        let path = rootfs.join(name);
        fs::create_dir_all(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(*mode))?;
    }

    let mut resolv = String::new();
    for ns in FALLBACK_NAMESERVERS {
        resolv.push_str(&format!("nameserver {}\n", ns));
    }
    fs::write(rootfs.join("etc").join("resolv.conf"), resolv)?;

    Ok(())
}
