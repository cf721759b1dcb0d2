//! # Image Store
//!
//! Maps `repo:version` tags to tar artifacts and their metadata companions
//! under `images/`. The filename scheme is the canonical lookup key:
//! `<repo>-<normalized_version>.tar.gz` + `<repo>-<normalized_version>.json`.
//! An image is present only when both files exist.
//!
//! Resolution accepts either a tag or a 4–12 hex prefix of a stored image
//! id. Tagging is restricted: the repository part must not change, only the
//! version component may.

use crate::error::{Error, Result};
use crate::layers;
use crate::metadata::ImageMetadata;
use crate::paths::{normalize_version, DataDir};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

// =============================================================================
// Tags
// =============================================================================

/// A parsed `repository:version` reference with the version normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Repository (distro or user image name).
    pub repo: String,
    /// Normalized version (`latest` when the reference carried none).
    pub version: String,
}

impl Tag {
    /// Parses an image reference. An absent version defaults to `latest`;
    /// `N` and `N.M` forms are normalized to three components.
    pub fn parse(spec: &str) -> Result<Self> {
        let (repo, version) = match spec.split_once(':') {
            Some((r, v)) => (r, v),
            None => (spec, "latest"),
        };
        if repo.is_empty() {
            return Err(Error::Invalid(format!("malformed image tag '{}'", spec)));
        }
        let version = if version.is_empty() { "latest" } else { version };
        Ok(Self {
            repo: repo.to_string(),
            version: normalize_version(version),
        })
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repo, self.version)
    }
}

// =============================================================================
// Image Store
// =============================================================================

/// Store over `images/*.{tar.gz,json}`.
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: DataDir,
}

impl ImageStore {
    /// Creates a store over the given data directory.
    pub fn new(dir: DataDir) -> Self {
        Self { dir }
    }

    /// True when both the artifact and its metadata exist for `tag`.
    pub fn exists(&self, tag: &Tag) -> bool {
        self.dir.image_artifact(&tag.repo, &tag.version).exists()
            && self.dir.image_metadata(&tag.repo, &tag.version).exists()
    }

    /// Reads the metadata record for `tag`.
    pub fn read(&self, tag: &Tag) -> Result<ImageMetadata> {
        if !self.exists(tag) {
            return Err(Error::ImageNotFound {
                reference: tag.to_string(),
            });
        }
        let path = self.dir.image_metadata(&tag.repo, &tag.version);
        let content = fs::read_to_string(&path).map_err(|e| Error::MetadataMalformed {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| Error::MetadataMalformed {
            path,
            reason: e.to_string(),
        })
    }

    /// Lists all stored images, newest first.
    pub fn list(&self) -> Result<Vec<ImageMetadata>> {
        let mut images = Vec::new();
        let dir = self.dir.images_dir();
        if !dir.exists() {
            return Ok(images);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|c| serde_json::from_str::<ImageMetadata>(&c).map_err(|e| e.to_string()))
            {
                Ok(meta) => images.push(meta),
                Err(e) => warn!("skipping image metadata {}: {}", path.display(), e),
            }
        }
        // ISO-8601 sorts lexicographically.
        images.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(images)
    }

    /// Resolves a tag or a 4–12 hex image-id prefix to `(tag, metadata)`.
    pub fn resolve(&self, spec: &str) -> Result<(Tag, ImageMetadata)> {
        let looks_like_prefix = spec.len() >= 4
            && spec.len() <= 12
            && spec.chars().all(|c| c.is_ascii_hexdigit());

        if looks_like_prefix {
            let mut matches = Vec::new();
            for meta in self.list()? {
                if meta.id.starts_with(spec) {
                    matches.push(meta);
                }
            }
            match matches.len() {
                0 => {} // fall through to tag lookup
                1 => {
                    let meta = matches.remove(0);
                    let tag = primary_tag(&meta)?;
                    return Ok((tag, meta));
                }
                n => {
                    return Err(Error::Ambiguous {
                        prefix: spec.to_string(),
                        count: n,
                    })
                }
            }
        }

        let tag = Tag::parse(spec)?;
        let meta = self.read(&tag)?;
        Ok((tag, meta))
    }

    /// Applies a new tag to an existing image.
    ///
    /// Only the version component may change; renaming across repositories
    /// is rejected. A changed filename copies the artifact so both tags stay
    /// independently removable.
    pub fn tag(&self, src_spec: &str, dst_spec: &str) -> Result<Tag> {
        let (src_tag, mut meta) = self.resolve(src_spec)?;
        let dst_tag = Tag::parse(dst_spec)?;

        if dst_tag.repo != src_tag.repo {
            return Err(Error::Invalid(format!(
                "cannot retag across repositories: '{}' -> '{}'",
                src_tag.repo, dst_tag.repo
            )));
        }
        if dst_tag == src_tag {
            return Ok(dst_tag);
        }

        let src_artifact = self.dir.image_artifact(&src_tag.repo, &src_tag.version);
        let dst_artifact = self.dir.image_artifact(&dst_tag.repo, &dst_tag.version);
        if src_artifact != dst_artifact {
            fs::copy(&src_artifact, &dst_artifact)?;
        }

        let label = dst_tag.to_string();
        if !meta.repo_tags.contains(&label) {
            meta.repo_tags.push(label);
        }
        meta.created = crate::paths::iso_timestamp();
        meta.paths.image_path = dst_artifact.to_string_lossy().to_string();

        crate::metadata::write_json_atomic(
            &self.dir.image_metadata(&dst_tag.repo, &dst_tag.version),
            &meta,
        )?;
        info!("tagged {} as {}", src_tag, dst_tag);
        Ok(dst_tag)
    }

    /// Removes an image: artifact, metadata, and the cached layer named by
    /// the image's `VirtualSize` hash. For a built image that is its final
    /// composed layer; pulled images carry `"unknown"` and reclaim nothing.
    ///
    /// Reclamation is conservative: intermediate step layers and the base
    /// image's FROM layer are never touched here.
    pub fn remove(&self, spec: &str) -> Result<Tag> {
        let (tag, meta) = self.resolve(spec)?;

        let artifact = self.dir.image_artifact(&tag.repo, &tag.version);
        let metadata = self.dir.image_metadata(&tag.repo, &tag.version);
        if artifact.exists() {
            fs::remove_file(&artifact)?;
        }
        if metadata.exists() {
            fs::remove_file(&metadata)?;
        }

        if meta.virtual_size != "unknown" && !meta.virtual_size.is_empty() {
            let cache = layers::LayerCache::new(self.dir.clone());
            cache.remove(&meta.virtual_size);
        }

        debug!("removed image {}", tag);
        Ok(tag)
    }

    /// Artifact path for a tag, without checking existence.
    pub fn artifact_path(&self, tag: &Tag) -> PathBuf {
        self.dir.image_artifact(&tag.repo, &tag.version)
    }
}

/// First `repo:version` label of an image record.
fn primary_tag(meta: &ImageMetadata) -> Result<Tag> {
    let label = meta.repo_tags.first().ok_or_else(|| Error::MetadataMalformed {
        path: PathBuf::from(&meta.paths.image_path),
        reason: "image record has no RepoTags".to_string(),
    })?;
    Tag::parse(label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_parse_defaults_to_latest() {
        let tag = Tag::parse("alpine").unwrap();
        assert_eq!(tag.repo, "alpine");
        assert_eq!(tag.version, "latest");
    }

    #[test]
    fn tag_parse_normalizes_versions() {
        assert_eq!(Tag::parse("alpine:3").unwrap().version, "3.0.0");
        assert_eq!(Tag::parse("ubuntu:22.04").unwrap().version, "22.04.0");
        assert_eq!(Tag::parse("ubuntu:22.04.3").unwrap().version, "22.04.3");
    }

    #[test]
    fn tag_parse_rejects_empty_repo() {
        assert!(Tag::parse(":latest").is_err());
    }
}
