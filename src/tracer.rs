//! # Tracer Invocation
//!
//! Builds the argument vector for the path-translating tracer and spawns it.
//! The vector is assembled deterministically so two launches of the same
//! container configuration are bit-identical, and so tests can assert the
//! contract without spawning anything:
//!
//! ```text
//! proot --link2symlink -0 -r <rootfs>
//!       -b /dev -b /proc -b /sys
//!       -b <host tmp>:/tmp -b <data dir>:<data dir> -b /:/host-rootfs
//!       -b /sdcard -b /storage -b /mnt
//!       [-b <rootfs>/bin/busybox:/bin/sh -b <rootfs>/bin/busybox:/usr/bin/env]
//!       [-b <user binds>...]
//!       -w <workdir> --kill-on-exit
//!       env -i HOME=/root PATH=… TERM=… LANG=C.UTF-8 [image env…] [cli env…]
//!       <command…>
//! ```
//!
//! The guest environment is rebuilt from scratch through `env -i`; later
//! `KEY=VALUE` entries win, which is how CLI `-e` flags override image
//! defaults. Any inherited loader-preload variable is cleared from the
//! tracer's own environment before spawn so host libraries never leak into
//! the guest.

use crate::constants::{
    FIXED_BINDS, GUEST_HOME, GUEST_LANG, GUEST_PATH, HOST_ROOTFS_MOUNT, STORAGE_BINDS,
    TRACER_BIN, TRACER_FLAG_BIND, TRACER_FLAG_KILL_ON_EXIT, TRACER_FLAG_LINK2SYMLINK,
    TRACER_FLAG_ROOT, TRACER_FLAG_ROOT_ID, TRACER_FLAG_WORKDIR,
};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, info};

/// Builder for one tracer invocation.
#[derive(Debug, Clone)]
pub struct TracerCommand {
    rootfs: PathBuf,
    binds: Vec<String>,
    workdir: String,
    env: Vec<String>,
    command: Vec<String>,
    term: Option<String>,
}

impl TracerCommand {
    /// Starts a builder for the given rootfs with the standard flags and no
    /// binds beyond the fixed set added by [`Self::standard_binds`].
    pub fn new(rootfs: impl Into<PathBuf>) -> Self {
        Self {
            rootfs: rootfs.into(),
            binds: Vec::new(),
            workdir: GUEST_HOME.to_string(),
            env: Vec::new(),
            command: Vec::new(),
            term: std::env::var("TERM").ok(),
        }
    }

    /// Adds the fixed bind list: `/dev /proc /sys`, the host temp directory
    /// as `/tmp`, the data directory at its own path, the host root at
    /// `/host-rootfs`, and the host storage roots.
    pub fn standard_binds(mut self, data_dir: &Path) -> Self {
        for bind in FIXED_BINDS {
            self.binds.push(bind.to_string());
        }
        self.binds.push(format!(
            "{}:/tmp",
            std::env::temp_dir().to_string_lossy()
        ));
        let data = data_dir.to_string_lossy();
        self.binds.push(format!("{}:{}", data, data));
        self.binds.push(format!("/:{}", HOST_ROOTFS_MOUNT));
        for bind in STORAGE_BINDS {
            self.binds.push(bind.to_string());
        }
        self
    }

    /// Adds the musl shim binds for Alpine-family images, routing `/bin/sh`
    /// and `/usr/bin/env` through busybox in the guest rootfs. No-op for
    /// other distros.
    pub fn distro_shims(mut self, distro: &str) -> Self {
        if distro == "alpine" {
            let busybox = self.rootfs.join("bin/busybox");
            let busybox = busybox.to_string_lossy();
            self.binds.push(format!("{}:/bin/sh", busybox));
            self.binds.push(format!("{}:/usr/bin/env", busybox));
        }
        self
    }

    /// Appends a user-requested bind (`host` or `host:guest`).
    pub fn bind(mut self, spec: impl Into<String>) -> Self {
        self.binds.push(spec.into());
        self
    }

    /// Appends several user-requested binds.
    pub fn binds<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for spec in specs {
            self.binds.push(spec.into());
        }
        self
    }

    /// Sets the guest working directory.
    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = dir.into();
        self
    }

    /// Appends `KEY=VALUE` entries to the guest environment. Order is
    /// preserved; later entries win inside the guest.
    pub fn envs<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for entry in entries {
            self.env.push(entry.into());
        }
        self
    }

    /// Sets the guest command.
    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Overrides the inherited `TERM` value; used by tests for determinism.
    pub fn term(mut self, term: Option<String>) -> Self {
        self.term = term;
        self
    }

    /// Returns the rootfs this invocation targets.
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Assembles the full argument vector (without the tracer binary itself).
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            TRACER_FLAG_LINK2SYMLINK.to_string(),
            TRACER_FLAG_ROOT_ID.to_string(),
            TRACER_FLAG_ROOT.to_string(),
            self.rootfs.to_string_lossy().to_string(),
        ];

        for bind in &self.binds {
            args.push(TRACER_FLAG_BIND.to_string());
            args.push(bind.clone());
        }

        args.push(TRACER_FLAG_WORKDIR.to_string());
        args.push(self.workdir.clone());
        args.push(TRACER_FLAG_KILL_ON_EXIT.to_string());

        // Without a guest command the tracer falls back to its own default
        // shell; the sanitized environment only applies when there is a
        // command for `env` to exec.
        if !self.command.is_empty() {
            args.push("env".to_string());
            args.push("-i".to_string());
            args.push(format!("HOME={}", GUEST_HOME));
            args.push(format!("PATH={}", GUEST_PATH));
            if let Some(term) = &self.term {
                args.push(format!("TERM={}", term));
            }
            args.push(format!("LANG={}", GUEST_LANG));
            for entry in &self.env {
                args.push(entry.clone());
            }
            args.extend(self.command.iter().cloned());
        }

        args
    }

    /// Runs the tracer in the foreground, inheriting stdio, and returns the
    /// guest exit code once it terminates.
    pub async fn run_foreground(&self) -> Result<i32> {
        let mut cmd = tokio::process::Command::new(TRACER_BIN);
        cmd.args(self.args());
        cmd.env_remove("LD_PRELOAD");

        debug!("spawning tracer (foreground) for {}", self.rootfs.display());
        let status = cmd.status().await.map_err(|e| Error::SpawnFailed {
            container: self.rootfs.to_string_lossy().to_string(),
            reason: e.to_string(),
        })?;

        Ok(exit_code(status))
    }

    /// Runs the tracer with captured stdout+stderr, for build steps.
    pub async fn run_captured(&self) -> Result<std::process::Output> {
        let mut cmd = tokio::process::Command::new(TRACER_BIN);
        cmd.args(self.args());
        cmd.env_remove("LD_PRELOAD");
        cmd.stdin(Stdio::null());

        cmd.output().await.map_err(|e| Error::SpawnFailed {
            container: self.rootfs.to_string_lossy().to_string(),
            reason: e.to_string(),
        })
    }

    /// Spawns the tracer detached, redirecting stdout and stderr to `log`.
    /// The child is not awaited; liveness is observed through the process
    /// table.
    pub fn spawn_detached(&self, log: &Path) -> Result<()> {
        let log_file = fs::File::create(log).map_err(|e| Error::SpawnFailed {
            container: self.rootfs.to_string_lossy().to_string(),
            reason: format!("cannot open log {}: {}", log.display(), e),
        })?;
        let log_err = log_file.try_clone().map_err(|e| Error::SpawnFailed {
            container: self.rootfs.to_string_lossy().to_string(),
            reason: e.to_string(),
        })?;

        let mut cmd = std::process::Command::new(TRACER_BIN);
        cmd.args(self.args());
        cmd.env_remove("LD_PRELOAD");
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log_file));
        cmd.stderr(Stdio::from(log_err));

        let child = cmd.spawn().map_err(|e| Error::SpawnFailed {
            container: self.rootfs.to_string_lossy().to_string(),
            reason: e.to_string(),
        })?;
        info!(
            "spawned detached tracer (pid {}) for {}",
            child.id(),
            self.rootfs.display()
        );
        // Deliberately not waited on: the process table is the source of
        // liveness truth, and the child must outlive this invocation.
        Ok(())
    }
}

/// Maps an exit status to a shell-convention exit code.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_starts_with_mode_flags() {
        let args = TracerCommand::new("/data/containers/x/rootfs")
            .term(None)
            .args();
        assert_eq!(
            &args[..4],
            &[
                "--link2symlink".to_string(),
                "-0".to_string(),
                "-r".to_string(),
                "/data/containers/x/rootfs".to_string(),
            ]
        );
    }

    #[test]
    fn env_wrapper_only_with_command() {
        let without = TracerCommand::new("/r").term(None).args();
        assert!(!without.contains(&"env".to_string()));

        let with = TracerCommand::new("/r")
            .term(None)
            .command(["/bin/sh"])
            .args();
        let env_pos = with.iter().position(|a| a == "env").unwrap();
        assert_eq!(with[env_pos + 1], "-i");
        assert_eq!(with.last().unwrap(), "/bin/sh");
    }

    #[test]
    fn cli_env_comes_after_image_env() {
        let args = TracerCommand::new("/r")
            .term(None)
            .envs(["A=image", "A=cli"])
            .command(["true"])
            .args();
        let first = args.iter().position(|a| a == "A=image").unwrap();
        let second = args.iter().position(|a| a == "A=cli").unwrap();
        assert!(first < second, "later entries must win inside env -i");
    }
}
