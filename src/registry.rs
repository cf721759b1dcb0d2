//! # Registry Client
//!
//! Image transport with a three-tier pull fallback and a token-authenticated
//! push.
//!
//! ## Pull Tiers
//!
//! 1. **Local**: both the artifact and its metadata already exist under
//!    `images/`; no network touched.
//! 2. **User registry**: plain HTTP download from the configured backend.
//!    The tarball is authoritative; a missing metadata companion is
//!    synthesized locally.
//! 3. **Upstream mirror**: for the known distros, a vendor URL is
//!    constructed (Alpine CDN, Ubuntu base-image mirror) and the metadata is
//!    always synthesized.
//!
//! A miss on every tier surfaces as `ImageNotFound`.
//!
//! ## Version Resolution
//!
//! `pull alpine` with no version scrapes the Alpine releases index and picks
//! the greatest `vMAJOR.MINOR`. Every other distro requires an explicit
//! version.
//!
//! ## Push
//!
//! One multipart POST carrying the artifact and metadata as two `files`
//! fields, authenticated with `Authorization: Bearer <token>`. No chunking,
//! no resume.

use crate::config::Config;
use crate::constants::{
    ALPINE_CDN, DOWNLOAD_TIMEOUT, REGISTRY_DOWNLOAD_PREFIX, REGISTRY_UPLOAD_PREFIX, UBUNTU_CDN,
};
use crate::error::{Error, Result};
use crate::metadata::{ImageContainerConfig, ImageMetadata, ImagePaths};
use crate::paths::{iso_timestamp, map_architecture, DataDir};
use crate::store::{ImageStore, Tag};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Hex length of an image id (truncated artifact hash).
const IMAGE_ID_LEN: usize = 32;

/// Registry transport over the image store.
pub struct RegistryClient {
    dir: DataDir,
    store: ImageStore,
    config: Config,
    http: reqwest::Client,
}

impl RegistryClient {
    /// Creates a client over the given data directory, loading the backend
    /// config if present.
    pub fn new(dir: DataDir) -> Result<Self> {
        let config = Config::load(&dir)?;
        Ok(Self {
            store: ImageStore::new(dir.clone()),
            dir,
            config,
            http: reqwest::Client::builder()
                .timeout(DOWNLOAD_TIMEOUT)
                .build()
                .map_err(|e| Error::NetworkFailed {
                    url: "<client init>".to_string(),
                    reason: e.to_string(),
                })?,
        })
    }

    /// Pulls an image reference, walking the fallback tiers in order.
    ///
    /// Returns the resolved tag and its metadata. `spec` may omit the
    /// version only for Alpine, where the latest release is resolved from
    /// the CDN index.
    pub async fn pull(&self, spec: &str) -> Result<(Tag, ImageMetadata)> {
        let version_given = spec.contains(':') && !spec.ends_with(':');
        let mut tag = Tag::parse(spec)?;

        if !version_given {
            tag.version = self.resolve_version(&tag.repo).await?;
        }

        // Tier 1: already present locally.
        if self.store.exists(&tag) {
            info!("image {} already present locally", tag);
            return Ok((tag.clone(), self.store.read(&tag)?));
        }

        // Tier 2: user registry.
        if let Some(backend) = self.config.backend() {
            match self.pull_from_backend(&tag, &backend.url, &backend.username).await {
                Ok(meta) => return Ok((tag, meta)),
                Err(e) => debug!("user registry miss for {}: {}", tag, e),
            }
        }

        // Tier 3: upstream distro mirror.
        match self.pull_from_mirror(&tag).await {
            Ok(meta) => Ok((tag, meta)),
            Err(e) => {
                debug!("upstream mirror miss for {}: {}", tag, e);
                Err(Error::ImageNotFound {
                    reference: tag.to_string(),
                })
            }
        }
    }

    /// Pushes a local image to the configured backend.
    pub async fn push(&self, spec: &str) -> Result<()> {
        let backend = self.config.backend().ok_or_else(|| {
            Error::Invalid("push requires a configured backend (config.json)".to_string())
        })?;

        let (tag, _meta) = self.store.resolve(spec)?;
        let artifact = self.dir.image_artifact(&tag.repo, &tag.version);
        let metadata = self.dir.image_metadata(&tag.repo, &tag.version);

        let url = format!(
            "{}/{}/{}/{}/{}",
            backend.url.trim_end_matches('/'),
            REGISTRY_UPLOAD_PREFIX,
            backend.username,
            tag.repo,
            tag.version
        );

        let tar_part = reqwest::multipart::Part::bytes(fs::read(&artifact)?)
            .file_name(format!("{}-{}.tar.gz", tag.repo, tag.version));
        let json_part = reqwest::multipart::Part::bytes(fs::read(&metadata)?)
            .file_name(format!("{}-{}.json", tag.repo, tag.version));
        let form = reqwest::multipart::Form::new()
            .part("files", tar_part)
            .part("files", json_part);

        info!("pushing {} to {}", tag, url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&backend.token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::NetworkFailed {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::NetworkFailed {
                url,
                reason: format!("upload rejected with status {}", response.status()),
            });
        }
        info!("pushed {}", tag);
        Ok(())
    }

    // =========================================================================
    // Version Resolution
    // =========================================================================

    /// Resolves an omitted version. Only Alpine supports this, via the CDN
    /// releases index; every other distro requires an explicit version.
    async fn resolve_version(&self, repo: &str) -> Result<String> {
        if repo != "alpine" {
            return Err(Error::VersionRequired {
                distro: repo.to_string(),
            });
        }

        let url = format!("{}/", ALPINE_CDN);
        let body = self.fetch_text(&url).await?;
        let latest = latest_alpine_release(&body).ok_or_else(|| Error::NetworkFailed {
            url,
            reason: "no release directories found in index".to_string(),
        })?;
        let version = crate::paths::normalize_version(&latest);
        info!("resolved alpine to version {}", version);
        Ok(version)
    }

    // =========================================================================
    // Pull Tiers
    // =========================================================================

    async fn pull_from_backend(
        &self,
        tag: &Tag,
        base_url: &str,
        username: &str,
    ) -> Result<ImageMetadata> {
        let prefix = format!(
            "{}/{}/{}/{}/{}",
            base_url.trim_end_matches('/'),
            REGISTRY_DOWNLOAD_PREFIX,
            username,
            tag.repo,
            tag.version
        );
        let tar_url = format!("{}/{}-{}.tar.gz", prefix, tag.repo, tag.version);
        let json_url = format!("{}/{}-{}.json", prefix, tag.repo, tag.version);

        let artifact_path = self.dir.image_artifact(&tag.repo, &tag.version);
        self.download_to(&tar_url, &artifact_path).await?;

        let metadata_path = self.dir.image_metadata(&tag.repo, &tag.version);
        match self.download_to(&json_url, &metadata_path).await {
            Ok(()) => self.store.read(tag),
            Err(e) => {
                // The tarball is authoritative; a registry without the
                // companion record still yields a usable image.
                warn!("metadata missing for {} ({}), synthesizing", tag, e);
                let meta = self.synthesize_metadata(tag, &artifact_path)?;
                crate::metadata::write_json_atomic(&metadata_path, &meta)?;
                Ok(meta)
            }
        }
    }

    async fn pull_from_mirror(&self, tag: &Tag) -> Result<ImageMetadata> {
        let arch = map_architecture()?;
        let url = mirror_url(&tag.repo, &tag.version, arch)?;

        let artifact_path = self.dir.image_artifact(&tag.repo, &tag.version);
        info!("pulling {} from {}", tag, url);
        self.download_to(&url, &artifact_path).await?;

        let meta = self.synthesize_metadata(tag, &artifact_path)?;
        crate::metadata::write_json_atomic(
            &self.dir.image_metadata(&tag.repo, &tag.version),
            &meta,
        )?;
        Ok(meta)
    }

    // =========================================================================
    // Transport Helpers
    // =========================================================================

    async fn fetch_text(&self, url: &str) -> Result<String> {
        let response = self.http.get(url).send().await.map_err(|e| Error::NetworkFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(Error::NetworkFailed {
                url: url.to_string(),
                reason: format!("status {}", response.status()),
            });
        }
        response.text().await.map_err(|e| Error::NetworkFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    /// Downloads `url` into `path` via a temp sibling, so a failed transfer
    /// never leaves a truncated artifact behind.
    async fn download_to(&self, url: &str, path: &Path) -> Result<()> {
        let response = self.http.get(url).send().await.map_err(|e| Error::NetworkFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(Error::NetworkFailed {
                url: url.to_string(),
                reason: format!("status {}", response.status()),
            });
        }

        let bytes = response.bytes().await.map_err(|e| Error::NetworkFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = path.with_extension(format!("partial.{}", uuid::Uuid::now_v7()));
        fs::write(&temp, &bytes)?;
        fs::rename(&temp, path).or_else(|_| {
            fs::copy(&temp, path).map(|_| ())?;
            fs::remove_file(&temp)
        })?;
        debug!("downloaded {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }

    /// Builds a metadata record for an artifact that arrived without one.
    fn synthesize_metadata(&self, tag: &Tag, artifact: &Path) -> Result<ImageMetadata> {
        let bytes = fs::read(artifact)?;
        let id = hex::encode(Sha256::digest(&bytes))[..IMAGE_ID_LEN].to_string();

        Ok(ImageMetadata {
            id,
            repo_tags: vec![tag.to_string()],
            created: iso_timestamp(),
            size: bytes.len() as u64,
            virtual_size: "unknown".to_string(),
            container_config: ImageContainerConfig::default(),
            os: "linux".to_string(),
            architecture: map_architecture()?.to_string(),
            paths: ImagePaths {
                image_path: artifact.to_string_lossy().to_string(),
            },
        })
    }
}

// =============================================================================
// Mirror URL Construction
// =============================================================================

/// Vendor URL for a known distro, or `ImageNotFound` for anything else.
pub fn mirror_url(repo: &str, version: &str, arch: &str) -> Result<String> {
    match repo {
        "alpine" => {
            let mut parts = version.split('.');
            let major = parts.next().unwrap_or("0");
            let minor = parts.next().unwrap_or("0");
            Ok(format!(
                "{}/v{}.{}/releases/{}/alpine-minirootfs-{}-{}.tar.gz",
                ALPINE_CDN, major, minor, arch, version, arch
            ))
        }
        "ubuntu" => Ok(format!(
            "{}/{}/release/ubuntu-base-{}-base-{}.tar.gz",
            UBUNTU_CDN, version, version, arch
        )),
        other => Err(Error::ImageNotFound {
            reference: format!("{}:{}", other, version),
        }),
    }
}

/// Picks the greatest `vMAJOR.MINOR` release directory from the Alpine CDN
/// index page. Returns `MAJOR.MINOR` without the `v` prefix.
pub fn latest_alpine_release(index_html: &str) -> Option<String> {
    let mut best: Option<(u64, u64)> = None;

    for chunk in index_html.split("href=\"v").skip(1) {
        let end = match chunk.find(['/', '"']) {
            Some(i) => i,
            None => continue,
        };
        let candidate = &chunk[..end];
        let (major, minor) = match candidate.split_once('.') {
            Some(pair) => pair,
            None => continue,
        };
        let major: u64 = match major.parse() {
            Ok(n) => n,
            Err(_) => continue,
        };
        let minor: u64 = match minor.parse() {
            Ok(n) => n,
            Err(_) => continue,
        };
        if best.map_or(true, |b| (major, minor) > b) {
            best = Some((major, minor));
        }
    }

    best.map(|(major, minor)| format!("{}.{}", major, minor))
}
