//! # Liveness Detection
//!
//! A container is running iff the host process table contains a tracer
//! process whose root-redirection argument points at that container's
//! rootfs. Stored PIDs are never recorded or trusted; every query rescans.
//!
//! The capability is a trait so the supervisor can be exercised in tests
//! with a scripted process table instead of a live `/proc`.

use crate::constants::{TRACER_BIN, TRACER_FLAG_ROOT};
use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// One observed tracer process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracerProcess {
    /// Host process id.
    pub pid: i32,
    /// The rootfs the tracer was told to redirect to.
    pub rootfs: PathBuf,
}

/// Process-table view of running tracers.
pub trait Liveness: Send + Sync {
    /// Enumerates every tracer process currently visible.
    fn enumerate(&self) -> Result<Vec<TracerProcess>>;

    /// Returns the tracer processes rooted at `rootfs`.
    fn find_by_rootfs(&self, rootfs: &Path) -> Result<Vec<TracerProcess>> {
        Ok(self
            .enumerate()?
            .into_iter()
            .filter(|p| p.rootfs == rootfs)
            .collect())
    }

    /// True when at least one tracer is rooted at `rootfs`.
    fn is_running(&self, rootfs: &Path) -> bool {
        self.find_by_rootfs(rootfs)
            .map(|procs| !procs.is_empty())
            .unwrap_or(false)
    }
}

/// `/proc`-backed scanner; the production implementation.
#[derive(Debug, Default, Clone)]
pub struct ProcScanner;

impl ProcScanner {
    /// Creates a scanner.
    pub fn new() -> Self {
        Self
    }
}

impl Liveness for ProcScanner {
    fn enumerate(&self) -> Result<Vec<TracerProcess>> {
        let mut out = Vec::new();
        let proc_dir = Path::new("/proc");
        if !proc_dir.exists() {
            return Ok(out);
        }

        for entry in fs::read_dir(proc_dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let name = entry.file_name();
            let pid: i32 = match name.to_string_lossy().parse() {
                Ok(pid) => pid,
                Err(_) => continue,
            };

            // Processes can exit mid-scan; unreadable entries are skipped.
            let cmdline = match fs::read(entry.path().join("cmdline")) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            let args: Vec<String> = cmdline
                .split(|b| *b == 0)
                .filter(|chunk| !chunk.is_empty())
                .map(|chunk| String::from_utf8_lossy(chunk).to_string())
                .collect();

            if let Some(rootfs) = match_tracer(&args) {
                out.push(TracerProcess { pid, rootfs });
            }
        }

        Ok(out)
    }
}

/// Extracts the root-redirection argument if `args` is a tracer command
/// line.
fn match_tracer(args: &[String]) -> Option<PathBuf> {
    let argv0 = args.first()?;
    let binary = argv0.rsplit('/').next().unwrap_or(argv0);
    if binary != TRACER_BIN {
        return None;
    }

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == TRACER_FLAG_ROOT {
            return iter.next().map(PathBuf::from);
        }
        if let Some(rest) = arg.strip_prefix(TRACER_FLAG_ROOT) {
            // `-r/path` single-argument form.
            if !rest.is_empty() && rest.starts_with('/') {
                return Some(PathBuf::from(rest));
            }
        }
    }
    None
}
