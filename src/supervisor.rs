//! # Container Supervisor
//!
//! Lifecycle management over the metadata store and the process table:
//! run, start, stop, restart, exec, logs, ps, rm.
//!
//! ## State Machine
//!
//! ```text
//!   ┌─────────┐  run/start   ┌─────────┐  guest exit / stop  ┌────────┐
//!   │ created │ ───────────► │ running │ ──────────────────► │ exited │
//!   └─────────┘              └─────────┘                     └───┬────┘
//!        ▲                                                       │ rm
//!        └── spawn failure reverts ──┘                           ▼
//!                                                             (gone)
//! ```
//!
//! Metadata is the source of truth for state, but `running` is always
//! cross-checked against the process table: a container whose tracer died
//! unobserved is reconciled to `exited` by `ps` and `stop`.
//!
//! ## Write Ordering
//!
//! `running` is written before the tracer is spawned, and reverted to
//! `created` if the spawn fails. The foreground path writes `exited` with
//! the observed exit code after the wait returns; detached launches leave
//! that to the next reconciling operation.

use crate::constants::{KILL_GRACE, LIVENESS_POLL, STOP_TIMEOUT};
use crate::error::{Error, Result};
use crate::liveness::{Liveness, ProcScanner};
use crate::metadata::{
    ContainerConfig, ContainerMetadata, ContainerPaths, ContainerState, ContainerStatus,
    HostConfig, ImageMetadata, ImageRef, MetadataStore, NetworkSettings,
};
use crate::paths::{generate_name, iso_timestamp, new_container_id, short_id, DataDir};
use crate::registry::RegistryClient;
use crate::rootfs;
use crate::store::{ImageStore, Tag};
use crate::tracer::TracerCommand;
use chrono::Utc;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// =============================================================================
// Options
// =============================================================================

/// Options for `run`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Container name; generated as `<distro>-<hex>` when absent.
    pub name: Option<String>,
    /// Launch detached, stdio redirected to the container log.
    pub detach: bool,
    /// Interactive with a TTY (`-it`); mutually exclusive with detach.
    pub interactive: bool,
    /// Remove the container when it exits.
    pub auto_remove: bool,
    /// Extra `KEY=VALUE` environment entries; appended after image env.
    pub env: Vec<String>,
    /// Extra `host:guest` binds.
    pub volumes: Vec<String>,
    /// Working directory override.
    pub workdir: Option<String>,
    /// Command override; falls back to the image default.
    pub command: Vec<String>,
}

/// Options for `exec`.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Interactive with a TTY.
    pub interactive: bool,
    /// Run detached, output to `exec-<timestamp>.log`.
    pub detach: bool,
    /// Requested user. Only `root` is directly supported; anything else is
    /// advisory: wrap the command with `su` inside the guest.
    pub user: Option<String>,
    /// Working directory override.
    pub workdir: Option<String>,
    /// Extra `KEY=VALUE` environment entries.
    pub env: Vec<String>,
}

/// Options for `logs`.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Stream appended lines until interrupted.
    pub follow: bool,
    /// Keep lines lexicographically at or after this ISO-8601 prefix.
    /// Only effective when the guest writes timestamped lines.
    pub since: Option<String>,
    /// Keep lines lexicographically at or before this ISO-8601 prefix.
    pub until: Option<String>,
    /// Only the last N lines.
    pub tail: Option<usize>,
    /// Prefix untimestamped lines with the read time.
    pub timestamps: bool,
    /// Print the full metadata record instead of the log.
    pub details: bool,
}

/// Options for `ps`.
#[derive(Debug, Clone, Default)]
pub struct PsOptions {
    /// Include exited and created containers.
    pub all: bool,
    /// Only print ids.
    pub quiet: bool,
    /// Only the most recently started container.
    pub latest: bool,
    /// Only the N most recently started containers.
    pub last: Option<usize>,
    /// Compute rootfs sizes.
    pub size: bool,
}

/// One row of `ps` output.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    /// Short container id.
    pub id: String,
    /// Source image label.
    pub image: String,
    /// Launch command, joined.
    pub command: String,
    /// Start timestamp.
    pub started_at: String,
    /// Human status column.
    pub status: String,
    /// Container name.
    pub name: String,
    /// Rootfs size in bytes, when requested.
    pub size: Option<u64>,
}

// =============================================================================
// Supervisor
// =============================================================================

/// Container lifecycle driver.
pub struct Supervisor {
    dir: DataDir,
    meta: MetadataStore,
    images: ImageStore,
    liveness: Box<dyn Liveness>,
}

impl Supervisor {
    /// Creates a supervisor with the `/proc` scanner.
    pub fn new(dir: DataDir) -> Self {
        Self::with_liveness(dir, Box::new(ProcScanner::new()))
    }

    /// Creates a supervisor with an injected liveness implementation.
    pub fn with_liveness(dir: DataDir, liveness: Box<dyn Liveness>) -> Self {
        Self {
            meta: MetadataStore::new(dir.clone()),
            images: ImageStore::new(dir.clone()),
            dir,
            liveness,
        }
    }

    /// Returns the metadata store.
    pub fn metadata(&self) -> &MetadataStore {
        &self.meta
    }

    // =========================================================================
    // run
    // =========================================================================

    /// Creates and starts a container from `image_spec`.
    ///
    /// Pulls the image if it is not present locally. Returns the new
    /// container id.
    pub async fn run(&self, image_spec: &str, opts: RunOptions) -> Result<String> {
        if opts.detach && opts.interactive {
            return Err(Error::Invalid(
                "--detach and --interactive are mutually exclusive".to_string(),
            ));
        }

        let registry = RegistryClient::new(self.dir.clone())?;
        let (tag, image) = registry.pull(image_spec).await?;

        let name = match &opts.name {
            Some(name) => name.clone(),
            None => generate_name(&tag.repo),
        };
        if self.dir.container_dir(&name).exists() {
            return Err(Error::AlreadyExists(name));
        }

        let id = new_container_id();
        let rootfs_path = self.dir.container_rootfs(&name);
        fs::create_dir_all(self.dir.container_dir(&name))?;

        let artifact = self.images.artifact_path(&tag);
        rootfs::assemble(&self.dir, &artifact, &tag.to_string(), &rootfs_path)?;

        let env = merged_env(&image, &opts.env);
        let command = resolve_command(&opts.command, &image, &tag.repo, opts.interactive);
        let workdir = resolve_workdir(opts.workdir.as_deref(), &image);
        let log_file = opts.detach.then(|| self.dir.container_log(&name));

        let meta = ContainerMetadata {
            id: id.clone(),
            name: name.clone(),
            image: ImageRef {
                name: tag.to_string(),
                id: image.id.clone(),
            },
            state: ContainerState {
                status: ContainerStatus::Created,
                running: false,
                detached_original: opts.detach,
                interactive_original: opts.interactive,
                started_at: String::new(),
                finished_at: String::new(),
                exit_code: 0,
            },
            config: ContainerConfig {
                hostname: name.clone(),
                domainname: String::new(),
                user: "root".to_string(),
                env: env.clone(),
                cmd: (!command.is_empty()).then(|| command.clone()),
                image: tag.to_string(),
                working_dir: workdir.clone(),
                entrypoint: None,
                healthcheck: None,
            },
            host_config: HostConfig {
                binds: opts.volumes.clone(),
                auto_remove: opts.auto_remove,
            },
            mounts: Vec::new(),
            network_settings: NetworkSettings::default(),
            paths: ContainerPaths {
                rootfs_path: rootfs_path.to_string_lossy().to_string(),
                log_file: log_file
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string()),
                image_path: artifact.to_string_lossy().to_string(),
            },
        };
        self.meta.write_container(&meta)?;

        info!("created container {} ({})", name, short_id(&id));
        self.launch(&meta, &tag.repo).await?;
        Ok(id)
    }

    // =========================================================================
    // start
    // =========================================================================

    /// Restarts an exited container from its stored configuration,
    /// honoring the original detach/interactive mode.
    pub async fn start(&self, spec: &str) -> Result<String> {
        let meta = self.meta.resolve(spec)?;
        let rootfs_path = Path::new(&meta.paths.rootfs_path);

        if self.liveness.is_running(rootfs_path) {
            return Err(Error::Invalid(format!(
                "container '{}' is already running",
                meta.name
            )));
        }

        let distro = distro_of(&meta.config.image);
        self.launch(&meta, &distro).await?;
        Ok(meta.name)
    }

    /// Launches the tracer for a container record, in its original mode,
    /// maintaining the metadata write ordering.
    async fn launch(&self, meta: &ContainerMetadata, distro: &str) -> Result<()> {
        let rootfs_path = Path::new(&meta.paths.rootfs_path);

        let mut tracer = TracerCommand::new(rootfs_path)
            .standard_binds(self.dir.base())
            .distro_shims(distro)
            .binds(meta.host_config.binds.iter().cloned())
            .workdir(meta.config.working_dir.clone())
            .envs(meta.config.env.iter().cloned());
        if let Some(cmd) = &meta.config.cmd {
            tracer = tracer.command(cmd.iter().cloned());
        }

        // running is recorded before the spawn so a crash between the two
        // leaves a reconcilable record, never an unexplained gap.
        let mut record = self.meta.read_container(&meta.name)?;
        record.state.status = ContainerStatus::Running;
        record.state.running = true;
        record.state.started_at = iso_timestamp();
        record.state.finished_at = String::new();
        self.meta.write_container(&record)?;

        if meta.state.detached_original {
            let log = self.dir.container_log(&meta.name);
            if let Err(e) = tracer.spawn_detached(&log) {
                self.revert_to_created(&meta.name);
                return Err(e);
            }
            info!("container {} detached, logs at {}", meta.name, log.display());
            Ok(())
        } else {
            let code = match tracer.run_foreground().await {
                Ok(code) => code,
                Err(e) => {
                    self.revert_to_created(&meta.name);
                    return Err(e);
                }
            };
            self.meta.update_state(
                &meta.name,
                ContainerStatus::Exited,
                false,
                Some(iso_timestamp()),
                Some(code),
            )?;
            debug!("container {} exited with code {}", meta.name, code);

            if meta.host_config.auto_remove {
                self.remove_container_dir(&meta.name)?;
            }
            Ok(())
        }
    }

    fn revert_to_created(&self, name: &str) {
        if let Err(e) =
            self.meta
                .update_state(name, ContainerStatus::Created, false, None, None)
        {
            warn!("failed to revert container '{}' to created: {}", name, e);
        }
    }

    // =========================================================================
    // stop / restart
    // =========================================================================

    /// Stops a container: `signal`, then KILL after `timeout`, then
    /// `StopFailed` if it survives one further second.
    pub async fn stop(
        &self,
        spec: &str,
        timeout: Duration,
        signal: i32,
        force: bool,
    ) -> Result<String> {
        self.stop_with(spec, timeout, signal, force, true).await
    }

    async fn stop_with(
        &self,
        spec: &str,
        timeout: Duration,
        signal: i32,
        force: bool,
        reap_auto: bool,
    ) -> Result<String> {
        let meta = self.meta.resolve(spec)?;
        let rootfs_path = Path::new(&meta.paths.rootfs_path).to_path_buf();

        let procs = self.liveness.find_by_rootfs(&rootfs_path)?;
        let mut exit_code = meta.state.exit_code;

        if !procs.is_empty() {
            let sig = if force { libc::SIGKILL } else { signal };
            info!(
                "stopping {} ({} tracer process(es), signal {})",
                meta.name,
                procs.len(),
                sig
            );
            for p in &procs {
                // SAFETY: kill() with a PID freshly observed in the scan.
                unsafe { libc::kill(p.pid, sig) };
            }

            if !self.await_death(&rootfs_path, timeout).await {
                warn!("{} still running after {:?}, sending KILL", meta.name, timeout);
                for p in self.liveness.find_by_rootfs(&rootfs_path)? {
                    // SAFETY: as above.
                    unsafe { libc::kill(p.pid, libc::SIGKILL) };
                }
                if !self.await_death(&rootfs_path, KILL_GRACE).await {
                    return Err(Error::StopFailed(meta.name));
                }
                exit_code = 128 + libc::SIGKILL;
            } else {
                exit_code = 128 + sig;
            }
        }

        self.meta.update_state(
            &meta.name,
            ContainerStatus::Exited,
            false,
            Some(iso_timestamp()),
            Some(exit_code),
        )?;

        if reap_auto && meta.host_config.auto_remove {
            self.remove_container_dir(&meta.name)?;
        }
        Ok(meta.name)
    }

    /// Polls until no tracer is rooted at `rootfs` or the deadline passes.
    async fn await_death(&self, rootfs: &Path, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.liveness.is_running(rootfs) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(LIVENESS_POLL).await;
        }
    }

    /// Force-stops and relaunches a container.
    pub async fn restart(&self, spec: &str, timeout: Duration) -> Result<String> {
        let name = self
            .stop_with(spec, timeout, libc::SIGTERM, true, false)
            .await?;
        self.start(&name).await
    }

    // =========================================================================
    // exec
    // =========================================================================

    /// Runs a command inside a running container via a parallel tracer
    /// invocation over the same rootfs and bind list.
    pub async fn exec(&self, spec: &str, command: Vec<String>, opts: ExecOptions) -> Result<i32> {
        if command.is_empty() {
            return Err(Error::Invalid("exec requires a command".to_string()));
        }

        let meta = self.meta.resolve(spec)?;
        let rootfs_path = Path::new(&meta.paths.rootfs_path);
        if !self.liveness.is_running(rootfs_path) {
            return Err(Error::Invalid(format!(
                "container '{}' is not running",
                meta.name
            )));
        }

        if let Some(user) = &opts.user {
            if user != "root" {
                warn!(
                    "only root is directly supported; wrap the command with 'su {}' inside the guest",
                    user
                );
            }
        }

        let workdir = opts
            .workdir
            .unwrap_or_else(|| meta.config.working_dir.clone());
        let mut env = meta.config.env.clone();
        env.extend(opts.env);

        let tracer = TracerCommand::new(rootfs_path)
            .standard_binds(self.dir.base())
            .distro_shims(&distro_of(&meta.config.image))
            .binds(meta.host_config.binds.iter().cloned())
            .workdir(workdir)
            .envs(env)
            .command(command);

        if opts.detach {
            let log = self
                .dir
                .container_dir(&meta.name)
                .join(format!("exec-{}.log", Utc::now().format("%Y%m%d-%H%M%S%.3f")));
            tracer.spawn_detached(&log)?;
            info!("exec detached, output at {}", log.display());
            Ok(0)
        } else {
            tracer.run_foreground().await
        }
    }

    // =========================================================================
    // logs
    // =========================================================================

    /// Collects log lines for a container according to `opts` (everything
    /// except `follow`, which is handled by the caller streaming loop).
    pub fn collect_logs(&self, spec: &str, opts: &LogOptions) -> Result<Vec<String>> {
        let meta = self.meta.resolve(spec)?;

        if opts.details {
            let pretty = serde_json::to_string_pretty(&meta)?;
            return Ok(pretty.lines().map(|l| l.to_string()).collect());
        }

        let log_path = self.dir.container_log(&meta.name);
        if !log_path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&log_path)?;
        let mut lines: Vec<String> = content.lines().map(|l| l.to_string()).collect();

        if let Some(since) = &opts.since {
            lines.retain(|line| line.as_str() >= since.as_str());
        }
        if let Some(until) = &opts.until {
            lines.retain(|line| {
                line.get(..until.len()).map_or(true, |prefix| prefix <= until.as_str())
            });
        }
        if let Some(tail) = opts.tail {
            if lines.len() > tail {
                lines.drain(..lines.len() - tail);
            }
        }
        if opts.timestamps {
            let now = iso_timestamp();
            lines = lines
                .into_iter()
                .map(|line| format!("{} {}", now, line))
                .collect();
        }
        Ok(lines)
    }

    /// Returns the log path for a container, for `--follow` streaming.
    pub fn log_path(&self, spec: &str) -> Result<std::path::PathBuf> {
        let meta = self.meta.resolve(spec)?;
        Ok(self.dir.container_log(&meta.name))
    }

    // =========================================================================
    // ps
    // =========================================================================

    /// Lists containers, reconciling stored state against the process table.
    ///
    /// A record marked running whose tracer has vanished is rewritten to
    /// exited (and reaped if auto-remove was requested).
    pub fn ps(&self, opts: &PsOptions) -> Result<Vec<ContainerSummary>> {
        let mut rows = Vec::new();

        for meta in self.meta.list_containers()? {
            let rootfs_path = std::path::PathBuf::from(&meta.paths.rootfs_path);
            let alive = self.liveness.is_running(&rootfs_path);

            let meta = if meta.state.running && !alive {
                // Crashed unobserved: reconcile.
                debug!("reconciling '{}' to exited", meta.name);
                self.meta.update_state(
                    &meta.name,
                    ContainerStatus::Exited,
                    false,
                    Some(iso_timestamp()),
                    None,
                )?;
                if meta.host_config.auto_remove {
                    self.remove_container_dir(&meta.name)?;
                    continue;
                }
                self.meta.read_container(&meta.name)?
            } else {
                meta
            };

            let status = match (meta.state.status, alive) {
                (_, true) => "Up".to_string(),
                (ContainerStatus::Created, false) => "Created".to_string(),
                (_, false) => format!("Exited ({})", meta.state.exit_code),
            };

            if !opts.all && !alive {
                continue;
            }

            let size = if opts.size {
                Some(dir_size(&rootfs_path))
            } else {
                None
            };

            rows.push(ContainerSummary {
                id: short_id(&meta.id).to_string(),
                image: meta.image.name.clone(),
                command: meta
                    .config
                    .cmd
                    .as_ref()
                    .map(|c| c.join(" "))
                    .unwrap_or_default(),
                started_at: meta.state.started_at.clone(),
                status,
                name: meta.name.clone(),
                size,
            });
        }

        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        if opts.latest {
            rows.truncate(1);
        } else if let Some(n) = opts.last {
            rows.truncate(n);
        }
        Ok(rows)
    }

    // =========================================================================
    // rm
    // =========================================================================

    /// Removes containers. Running containers require `force`, which stops
    /// them first. The bind list needs no separate cleanup; `volumes` is
    /// accepted for interface compatibility.
    pub async fn rm(&self, specs: &[String], force: bool, _volumes: bool) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for spec in specs {
            let meta = self.meta.resolve(spec)?;
            let rootfs_path = Path::new(&meta.paths.rootfs_path);

            if self.liveness.is_running(rootfs_path) {
                if !force {
                    return Err(Error::InUse(meta.name));
                }
                self.stop_with(&meta.name, STOP_TIMEOUT, libc::SIGTERM, true, false)
                    .await?;
            }

            self.remove_container_dir(&meta.name)?;
            removed.push(meta.name);
        }
        Ok(removed)
    }

    fn remove_container_dir(&self, name: &str) -> Result<()> {
        let dir = self.dir.container_dir(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        info!("removed container {}", name);
        Ok(())
    }
}

// =============================================================================
// Launch Configuration Resolution
// =============================================================================

/// Image env followed by CLI env; later entries win inside the guest.
fn merged_env(image: &ImageMetadata, cli_env: &[String]) -> Vec<String> {
    let mut env = image.container_config.env.clone();
    env.extend(cli_env.iter().cloned());
    env
}

/// CLI command, else image default, else the distro shell when interactive,
/// else nothing.
fn resolve_command(
    cli: &[String],
    image: &ImageMetadata,
    distro: &str,
    interactive: bool,
) -> Vec<String> {
    if !cli.is_empty() {
        return cli.to_vec();
    }
    if let Some(cmd) = &image.container_config.cmd {
        if !cmd.is_empty() {
            return cmd.clone();
        }
    }
    if interactive {
        return default_shell(distro);
    }
    Vec::new()
}

/// CLI workdir wins, else the image default (already `/root` when unset).
fn resolve_workdir(cli: Option<&str>, image: &ImageMetadata) -> String {
    match cli {
        Some(dir) => dir.to_string(),
        None => image.container_config.working_dir.clone(),
    }
}

/// Interactive login shell per distro.
pub fn default_shell(distro: &str) -> Vec<String> {
    match distro {
        "ubuntu" => vec!["/bin/bash".to_string(), "--login".to_string()],
        _ => vec!["/bin/sh".to_string()],
    }
}

/// Repository part of an image label (`alpine:3.20.0` → `alpine`).
fn distro_of(image_label: &str) -> String {
    Tag::parse(image_label)
        .map(|t| t.repo)
        .unwrap_or_else(|_| image_label.to_string())
}

/// Recursive byte size of a directory tree; unreadable entries count as 0.
fn dir_size(path: &Path) -> u64 {
    let mut total = 0u64;
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            let p = entry.path();
            if p.is_dir() {
                total += dir_size(&p);
            } else if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ImageContainerConfig, ImagePaths};

    fn image_with_cmd(cmd: Option<Vec<String>>) -> ImageMetadata {
        ImageMetadata {
            id: "ab".repeat(16),
            repo_tags: vec!["alpine:3.20.0".to_string()],
            created: "2024-01-01T00:00:00.000Z".to_string(),
            size: 0,
            virtual_size: "unknown".to_string(),
            container_config: ImageContainerConfig {
                cmd,
                working_dir: "/root".to_string(),
                entrypoint: None,
                env: vec!["FROM_IMAGE=1".to_string()],
            },
            os: "linux".to_string(),
            architecture: "arm64".to_string(),
            paths: ImagePaths {
                image_path: "/tmp/x.tar.gz".to_string(),
            },
        }
    }

    #[test]
    fn cli_command_wins() {
        let image = image_with_cmd(Some(vec!["/app".to_string()]));
        let cmd = resolve_command(&["echo".to_string()], &image, "alpine", false);
        assert_eq!(cmd, vec!["echo"]);
    }

    #[test]
    fn image_cmd_used_when_cli_empty() {
        let image = image_with_cmd(Some(vec!["/app".to_string()]));
        assert_eq!(resolve_command(&[], &image, "alpine", false), vec!["/app"]);
    }

    #[test]
    fn interactive_falls_back_to_shell() {
        let image = image_with_cmd(None);
        assert_eq!(
            resolve_command(&[], &image, "ubuntu", true),
            vec!["/bin/bash", "--login"]
        );
        assert_eq!(resolve_command(&[], &image, "alpine", true), vec!["/bin/sh"]);
    }

    #[test]
    fn non_interactive_without_cmd_is_empty() {
        let image = image_with_cmd(None);
        assert!(resolve_command(&[], &image, "alpine", false).is_empty());
    }

    #[test]
    fn env_merge_order() {
        let image = image_with_cmd(None);
        let env = merged_env(&image, &["CLI=1".to_string()]);
        assert_eq!(env, vec!["FROM_IMAGE=1", "CLI=1"]);
    }
}
