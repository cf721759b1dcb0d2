//! # Layered Image Builder
//!
//! Executes a recipe against a base image, one directive per step, with a
//! content-addressed cache short-circuiting unchanged prefixes:
//!
//! ```text
//! key(0) = H(base tag)                 (the FROM layer)
//! key(n) = H(key(n-1) ‖ '-' ‖ H(line(n)) [‖ H(copy source bytes)])
//! ```
//!
//! A cache hit restores the cached snapshot as the build rootfs and skips
//! execution entirely; a miss runs the step inside the tracer, captures the
//! output to `step_<N>.log`, and snapshots the rootfs into the cache. Cache
//! fill failures are warnings: the build result is identical, only the next
//! build pays again.
//!
//! The final rootfs is emitted as a gzipped tar (excluding the volatile
//! trees) plus a metadata record carrying the accumulated `CMD`, `WORKDIR`,
//! and `ENV` state. The temporary build container is deleted on both the
//! success and failure paths.

use crate::constants::BUILD_CONTEXT_MOUNT;
use crate::error::{Error, Result};
use crate::layers::{self, LayerCache};
use crate::metadata::{ImageContainerConfig, ImageMetadata, ImagePaths};
use crate::paths::{iso_timestamp, map_architecture, DataDir};
use crate::recipe::{Directive, Recipe};
use crate::registry::RegistryClient;
use crate::rootfs;
use crate::store::{ImageStore, Tag};
use crate::tracer::TracerCommand;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Archive prefixes excluded from emitted artifacts. The directories
/// themselves are kept, their contents are not.
const EMIT_EXCLUDED: &[&str] = &["dev", "proc", "sys", "tmp", "run"];

/// Hex length of an image id (truncated artifact hash).
const IMAGE_ID_LEN: usize = 32;

/// Image build driver.
pub struct Builder {
    dir: DataDir,
    images: ImageStore,
    cache: LayerCache,
}

impl Builder {
    /// Creates a builder over the given data directory.
    pub fn new(dir: DataDir) -> Self {
        Self {
            images: ImageStore::new(dir.clone()),
            cache: LayerCache::new(dir.clone()),
            dir,
        }
    }

    /// Builds `tag_spec` from a recipe and context directory.
    ///
    /// Returns the emitted tag and metadata. On step failure the step log is
    /// dumped to stderr and the temporary build container is deleted.
    pub async fn build(
        &self,
        recipe_path: &Path,
        context: &Path,
        tag_spec: &str,
    ) -> Result<(Tag, ImageMetadata)> {
        let recipe = Recipe::parse_file(recipe_path)?;
        let out_tag = Tag::parse(tag_spec)?;

        let registry = RegistryClient::new(self.dir.clone())?;
        let (base_tag, base_image) = registry.pull(&recipe.base).await?;

        // Temporary build container, deleted on every exit path.
        let build_name = format!("build-{}", &crate::paths::new_container_id()[..8]);
        let build_dir = self.dir.container_dir(&build_name);
        let build_rootfs = self.dir.container_rootfs(&build_name);
        fs::create_dir_all(&build_dir)?;

        let result = self
            .run_steps(&recipe, &base_tag, &base_image, &build_dir, &build_rootfs, context, &out_tag)
            .await;

        let emitted = match result {
            Ok(emitted) => emitted,
            Err(e) => {
                let _ = fs::remove_dir_all(&build_dir);
                return Err(e);
            }
        };

        fs::remove_dir_all(&build_dir)?;
        info!("built {}", out_tag);
        Ok(emitted)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &self,
        recipe: &Recipe,
        base_tag: &Tag,
        base_image: &ImageMetadata,
        build_dir: &Path,
        build_rootfs: &Path,
        context: &Path,
        out_tag: &Tag,
    ) -> Result<(Tag, ImageMetadata)> {
        let artifact = self.images.artifact_path(base_tag);
        rootfs::assemble(&self.dir, &artifact, &base_tag.to_string(), build_rootfs)?;

        let distro = base_tag.repo.clone();
        let mut layer_key = layers::from_layer_key(&base_tag.to_string());
        let mut workdir = base_image.container_config.working_dir.clone();
        let mut env = base_image.container_config.env.clone();
        let mut cmd: Option<Vec<String>> = None;

        let total = recipe.steps.len();
        for (index, step) in recipe.steps.iter().enumerate() {
            let n = index + 1;
            let started = Instant::now();
            println!("[{}/{}] {} {}", n, total, step.directive.kind(), step.directive.args());

            // Chain this step onto the running key. COPY keys also cover the
            // source bytes so edited files invalidate the step.
            let copy_bytes = match &step.directive {
                Directive::Copy { src, .. } => Some(hash_copy_source(&context.join(src))?),
                _ => None,
            };
            let step_component = layers::step_key(&step.line, copy_bytes.as_deref());
            layer_key = layers::chain_key(&layer_key, &step_component);

            let cached = self.cache.lookup(&layer_key);
            let hit = cached.is_some();
            if let Some(cached_dir) = cached {
                // Cached entries are full rootfs snapshots. Replace the
                // rootfs rather than overlaying: an overlay would resurrect
                // files the step deleted.
                fs::remove_dir_all(build_rootfs)?;
                layers::copy_dir_recursive(&cached_dir, build_rootfs)?;
            } else {
                match &step.directive {
                    Directive::Run(shell_cmd) => {
                        self.exec_step(
                            n,
                            build_dir,
                            build_rootfs,
                            &distro,
                            &workdir,
                            &env,
                            vec![shell_for(&distro).to_string(), "-c".to_string(), shell_cmd.clone()],
                            None,
                        )
                        .await?;
                    }
                    Directive::Copy { src, dst } => {
                        self.exec_step(
                            n,
                            build_dir,
                            build_rootfs,
                            &distro,
                            &workdir,
                            &env,
                            vec![
                                "cp".to_string(),
                                "-a".to_string(),
                                format!("{}/{}", BUILD_CONTEXT_MOUNT, src),
                                dst.clone(),
                            ],
                            Some(context),
                        )
                        .await?;
                    }
                    // Metadata-only steps mutate builder state, not the
                    // rootfs; they still get a cache entry so reruns render
                    // them as CACHED.
                    Directive::Workdir(_) | Directive::Env(_) | Directive::Cmd(_) => {}
                }
                self.cache.fill(&layer_key, build_rootfs);
            }

            match &step.directive {
                Directive::Workdir(dir) => workdir = dir.clone(),
                Directive::Env(entry) => env.push(entry.clone()),
                Directive::Cmd(command) => cmd = Some(command.clone()),
                _ => {}
            }

            let marker = if hit { " CACHED" } else { "" };
            println!("     ->{} ({:.1}s)", marker, started.elapsed().as_secs_f64());
        }

        self.emit(out_tag, build_rootfs, &layer_key, workdir, env, cmd)
    }

    /// Runs one build step inside the tracer, capturing output to
    /// `step_<N>.log`. Non-zero exit dumps the log and aborts.
    #[allow(clippy::too_many_arguments)]
    async fn exec_step(
        &self,
        n: usize,
        build_dir: &Path,
        build_rootfs: &Path,
        distro: &str,
        workdir: &str,
        env: &[String],
        command: Vec<String>,
        context: Option<&Path>,
    ) -> Result<()> {
        let mut tracer = TracerCommand::new(build_rootfs)
            .standard_binds(self.dir.base())
            .distro_shims(distro)
            .workdir(workdir.to_string())
            .envs(env.iter().cloned())
            .command(command);
        if let Some(context) = context {
            tracer = tracer.bind(format!(
                "{}:{}",
                context.to_string_lossy(),
                BUILD_CONTEXT_MOUNT
            ));
        }

        let output = tracer.run_captured().await?;
        let log_path = build_dir.join(format!("step_{}.log", n));
        let mut log = output.stdout.clone();
        log.extend_from_slice(&output.stderr);
        fs::write(&log_path, &log)?;

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let log_text = String::from_utf8_lossy(&log).to_string();
            eprintln!("{}", log_text);
            return Err(Error::BuildFailed {
                step: n,
                code,
                log: log_text,
            });
        }
        debug!("step {} ok, log at {}", n, log_path.display());
        Ok(())
    }

    /// Emits the artifact and metadata for a finished build.
    fn emit(
        &self,
        tag: &Tag,
        build_rootfs: &Path,
        final_layer_key: &str,
        workdir: String,
        env: Vec<String>,
        cmd: Option<Vec<String>>,
    ) -> Result<(Tag, ImageMetadata)> {
        let artifact = self.dir.image_artifact(&tag.repo, &tag.version);
        let size = emit_artifact(build_rootfs, &artifact)?;

        let bytes = fs::read(&artifact)?;
        let id = hex::encode(Sha256::digest(&bytes))[..IMAGE_ID_LEN].to_string();

        let meta = ImageMetadata {
            id,
            repo_tags: vec![tag.to_string()],
            created: iso_timestamp(),
            size,
            virtual_size: final_layer_key.to_string(),
            container_config: ImageContainerConfig {
                cmd,
                working_dir: workdir,
                entrypoint: None,
                env,
            },
            os: "linux".to_string(),
            architecture: map_architecture()?.to_string(),
            paths: ImagePaths {
                image_path: artifact.to_string_lossy().to_string(),
            },
        };

        crate::metadata::write_json_atomic(
            &self.dir.image_metadata(&tag.repo, &tag.version),
            &meta,
        )?;
        Ok((tag.clone(), meta))
    }
}

/// Shell used for RUN directives, per distro.
fn shell_for(distro: &str) -> &'static str {
    match distro {
        "ubuntu" => "/bin/bash",
        _ => "/bin/sh",
    }
}

/// Bytes hashed for a COPY source: file contents, or a deterministic walk of
/// a directory (sorted relative paths interleaved with file contents).
fn hash_copy_source(path: &Path) -> Result<Vec<u8>> {
    if !path.exists() {
        return Err(Error::Invalid(format!(
            "COPY source '{}' does not exist in the build context",
            path.display()
        )));
    }
    if path.is_file() {
        return Ok(fs::read(path)?);
    }

    let mut buffer = Vec::new();
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        for entry in entries {
            let rel = entry.strip_prefix(path).unwrap_or(&entry);
            buffer.extend_from_slice(rel.to_string_lossy().as_bytes());
            buffer.push(0);
            if entry.is_dir() {
                stack.push(entry);
            } else if entry.is_file() {
                buffer.extend_from_slice(&fs::read(&entry)?);
            }
        }
    }
    Ok(buffer)
}

/// Packs a rootfs into a gzipped tar, excluding the volatile trees'
/// contents, and returns the artifact size in bytes.
pub fn emit_artifact(rootfs: &Path, artifact: &Path) -> Result<u64> {
    if let Some(parent) = artifact.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(artifact)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    append_tree(&mut builder, rootfs, Path::new(""))?;

    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(fs::metadata(artifact)?.len())
}

fn append_tree<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    rel: &Path,
) -> Result<()> {
    let dir = root.join(rel);
    let mut entries: Vec<_> = fs::read_dir(&dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let child_rel = rel.join(entry.file_name());
        let child = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            builder.append_dir(&child_rel, &child)?;
            let top_level = rel.as_os_str().is_empty();
            let excluded = top_level
                && EMIT_EXCLUDED
                    .iter()
                    .any(|name| entry.file_name() == *name);
            if excluded {
                continue;
            }
            append_tree(builder, root, &child_rel)?;
        } else if let Err(e) = builder.append_path_with_name(&child, &child_rel) {
            // Sockets and vanished files are not worth failing the build.
            warn!("skipping {} during emit: {}", child.display(), e);
        }
    }
    Ok(())
}
