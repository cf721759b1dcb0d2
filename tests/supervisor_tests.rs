//! Tests for the container supervisor over a scripted process table.
//!
//! The `Liveness` seam lets these tests drive reconciliation, stop, and
//! removal logic without a tracer binary or real guest processes.

use proobox::builder::emit_artifact;
use proobox::liveness::{Liveness, TracerProcess};
use proobox::metadata::{
    write_json_atomic, ContainerConfig, ContainerMetadata, ContainerPaths, ContainerState,
    ContainerStatus, HostConfig, ImageContainerConfig, ImageMetadata, ImagePaths, ImageRef,
    MetadataStore, NetworkSettings,
};
use proobox::paths::DataDir;
use proobox::supervisor::{LogOptions, PsOptions, RunOptions, Supervisor};
use proobox::Error;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// Scripted Liveness
// =============================================================================

/// Returns one scripted snapshot per `enumerate` call; the last snapshot
/// repeats forever.
struct ScriptedLiveness {
    snapshots: Mutex<(usize, Vec<Vec<TracerProcess>>)>,
}

impl ScriptedLiveness {
    fn new(snapshots: Vec<Vec<TracerProcess>>) -> Box<Self> {
        Box::new(Self {
            snapshots: Mutex::new((0, snapshots)),
        })
    }

    fn empty() -> Box<Self> {
        Self::new(vec![Vec::new()])
    }
}

impl Liveness for ScriptedLiveness {
    fn enumerate(&self) -> proobox::Result<Vec<TracerProcess>> {
        let mut guard = self.snapshots.lock().unwrap();
        let (index, snapshots) = &mut *guard;
        if snapshots.is_empty() {
            return Ok(Vec::new());
        }
        let snapshot = snapshots[(*index).min(snapshots.len() - 1)].clone();
        *index += 1;
        Ok(snapshot)
    }
}

fn tracer_at(rootfs: &std::path::Path) -> Vec<TracerProcess> {
    vec![TracerProcess {
        // A PID no live process will hold, so stray kill() calls are inert.
        pid: i32::MAX - 7,
        rootfs: rootfs.to_path_buf(),
    }]
}

// =============================================================================
// Fixtures
// =============================================================================

fn data_dir(temp: &TempDir) -> DataDir {
    DataDir::with_base(temp.path().join("data")).unwrap()
}

fn seed_image(dir: &DataDir, temp: &TempDir) {
    let tree = temp.path().join("base-tree");
    fs::create_dir_all(tree.join("etc")).unwrap();
    fs::write(tree.join("etc/os-release"), "ID=alpine\n").unwrap();

    let artifact = dir.image_artifact("alpine", "3.20.0");
    emit_artifact(&tree, &artifact).unwrap();

    let meta = ImageMetadata {
        id: "aa".repeat(16),
        repo_tags: vec!["alpine:3.20.0".to_string()],
        created: "2024-01-01T00:00:00.000Z".to_string(),
        size: 1,
        virtual_size: "unknown".to_string(),
        container_config: ImageContainerConfig::default(),
        os: "linux".to_string(),
        architecture: "arm64".to_string(),
        paths: ImagePaths {
            image_path: artifact.to_string_lossy().to_string(),
        },
    };
    write_json_atomic(&dir.image_metadata("alpine", "3.20.0"), &meta).unwrap();
}

/// Writes a container record (and its directories) directly, bypassing run.
fn seed_container(
    dir: &DataDir,
    name: &str,
    id: &str,
    status: ContainerStatus,
    running: bool,
    auto_remove: bool,
) -> PathBuf {
    let rootfs = dir.container_rootfs(name);
    fs::create_dir_all(&rootfs).unwrap();

    let meta = ContainerMetadata {
        id: id.to_string(),
        name: name.to_string(),
        image: ImageRef {
            name: "alpine:3.20.0".to_string(),
            id: "aa".repeat(16),
        },
        state: ContainerState {
            status,
            running,
            detached_original: true,
            interactive_original: false,
            started_at: "2024-05-01T10:00:00.000Z".to_string(),
            finished_at: String::new(),
            exit_code: 0,
        },
        config: ContainerConfig {
            hostname: name.to_string(),
            domainname: String::new(),
            user: "root".to_string(),
            env: vec![],
            cmd: Some(vec!["sleep".to_string(), "3600".to_string()]),
            image: "alpine:3.20.0".to_string(),
            working_dir: "/root".to_string(),
            entrypoint: None,
            healthcheck: None,
        },
        host_config: HostConfig {
            binds: vec![],
            auto_remove,
        },
        mounts: vec![],
        network_settings: NetworkSettings::default(),
        paths: ContainerPaths {
            rootfs_path: rootfs.to_string_lossy().to_string(),
            log_file: None,
            image_path: dir
                .image_artifact("alpine", "3.20.0")
                .to_string_lossy()
                .to_string(),
        },
    };
    write_json_atomic(&dir.container_metadata(name), &meta).unwrap();
    rootfs
}

// =============================================================================
// run: Validation
// =============================================================================

#[tokio::test]
async fn test_run_rejects_detach_with_interactive() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    let supervisor = Supervisor::with_liveness(dir, ScriptedLiveness::empty());

    let err = supervisor
        .run(
            "alpine:3.20.0",
            RunOptions {
                detach: true,
                interactive: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
}

#[tokio::test]
async fn test_run_rejects_duplicate_name() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    seed_image(&dir, &temp);
    fs::create_dir_all(dir.container_dir("web")).unwrap();

    let supervisor = Supervisor::with_liveness(dir, ScriptedLiveness::empty());
    let err = supervisor
        .run(
            "alpine:3.20.0",
            RunOptions {
                name: Some("web".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
}

#[tokio::test]
async fn test_run_missing_image_fails() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    let supervisor = Supervisor::with_liveness(dir, ScriptedLiveness::empty());

    let err = supervisor
        .run("ghost:1.0.0", RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ImageNotFound { .. }));
}

// =============================================================================
// stop
// =============================================================================

#[tokio::test]
async fn test_stop_dead_container_records_exited() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    seed_container(&dir, "w1", &"11".repeat(32), ContainerStatus::Running, true, false);

    let supervisor = Supervisor::with_liveness(dir.clone(), ScriptedLiveness::empty());
    supervisor
        .stop("w1", Duration::from_secs(1), libc::SIGTERM, false)
        .await
        .unwrap();

    let meta = MetadataStore::new(dir).read_container("w1").unwrap();
    assert_eq!(meta.state.status, ContainerStatus::Exited);
    assert!(!meta.state.running);
    assert!(!meta.state.finished_at.is_empty());
}

#[tokio::test]
async fn test_stop_reaps_auto_remove_containers() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    seed_container(&dir, "w1", &"11".repeat(32), ContainerStatus::Running, true, true);

    let supervisor = Supervisor::with_liveness(dir.clone(), ScriptedLiveness::empty());
    supervisor
        .stop("w1", Duration::from_secs(1), libc::SIGTERM, false)
        .await
        .unwrap();

    assert!(
        !dir.container_dir("w1").exists(),
        "--rm containers are removed once they reach exited"
    );
}

#[tokio::test]
async fn test_stop_by_short_id() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    let id = format!("cafe{}", "0".repeat(60));
    seed_container(&dir, "w1", &id, ContainerStatus::Running, true, false);

    let supervisor = Supervisor::with_liveness(dir.clone(), ScriptedLiveness::empty());
    let name = supervisor
        .stop("cafe", Duration::from_secs(1), libc::SIGTERM, false)
        .await
        .unwrap();
    assert_eq!(name, "w1");
}

#[tokio::test]
async fn test_stop_ambiguous_short_id() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    seed_container(&dir, "a", &format!("cafe1{}", "0".repeat(59)), ContainerStatus::Running, true, false);
    seed_container(&dir, "b", &format!("cafe2{}", "0".repeat(59)), ContainerStatus::Running, true, false);

    let supervisor = Supervisor::with_liveness(dir, ScriptedLiveness::empty());
    let err = supervisor
        .stop("cafe", Duration::from_secs(1), libc::SIGTERM, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Ambiguous { .. }));
}

// =============================================================================
// start / exec preconditions
// =============================================================================

#[tokio::test]
async fn test_start_running_container_rejected() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    let rootfs = seed_container(&dir, "w1", &"22".repeat(32), ContainerStatus::Running, true, false);

    let supervisor =
        Supervisor::with_liveness(dir, ScriptedLiveness::new(vec![tracer_at(&rootfs)]));
    let err = supervisor.start("w1").await.unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
}

#[tokio::test]
async fn test_exec_requires_running() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    seed_container(&dir, "w1", &"22".repeat(32), ContainerStatus::Exited, false, false);

    let supervisor = Supervisor::with_liveness(dir, ScriptedLiveness::empty());
    let err = supervisor
        .exec("w1", vec!["true".to_string()], Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
}

#[tokio::test]
async fn test_exec_requires_command() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    seed_container(&dir, "w1", &"22".repeat(32), ContainerStatus::Running, true, false);

    let supervisor = Supervisor::with_liveness(dir, ScriptedLiveness::empty());
    let err = supervisor.exec("w1", vec![], Default::default()).await.unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
}

// =============================================================================
// ps
// =============================================================================

#[tokio::test]
async fn test_ps_reconciles_stale_running_to_exited() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    seed_container(&dir, "w1", &"33".repeat(32), ContainerStatus::Running, true, false);

    let supervisor = Supervisor::with_liveness(dir.clone(), ScriptedLiveness::empty());
    let rows = supervisor.ps(&PsOptions { all: true, ..Default::default() }).unwrap();

    assert_eq!(rows.len(), 1);
    assert!(rows[0].status.starts_with("Exited"));

    let meta = MetadataStore::new(dir).read_container("w1").unwrap();
    assert_eq!(meta.state.status, ContainerStatus::Exited);
    assert!(!meta.state.running);
}

#[tokio::test]
async fn test_ps_reaps_crashed_auto_remove_containers() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    seed_container(&dir, "w1", &"33".repeat(32), ContainerStatus::Running, true, true);

    let supervisor = Supervisor::with_liveness(dir.clone(), ScriptedLiveness::empty());
    let rows = supervisor.ps(&PsOptions { all: true, ..Default::default() }).unwrap();

    assert!(rows.is_empty());
    assert!(!dir.container_dir("w1").exists());
}

#[tokio::test]
async fn test_ps_default_hides_stopped() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    let rootfs_live = seed_container(&dir, "up", &"44".repeat(32), ContainerStatus::Running, true, false);
    seed_container(&dir, "down", &"55".repeat(32), ContainerStatus::Exited, false, false);

    let supervisor =
        Supervisor::with_liveness(dir, ScriptedLiveness::new(vec![tracer_at(&rootfs_live)]));

    let rows = supervisor.ps(&PsOptions::default()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name, "up");
    assert_eq!(rows[0].status, "Up");
}

#[tokio::test]
async fn test_ps_sorted_and_truncated() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    seed_container(&dir, "old", &"66".repeat(32), ContainerStatus::Exited, false, false);
    let rootfs = seed_container(&dir, "new", &"77".repeat(32), ContainerStatus::Running, true, false);

    // Bump the newer container's start time above the fixture default.
    let store = MetadataStore::new(dir.clone());
    let mut meta = store.read_container("new").unwrap();
    meta.state.started_at = "2024-06-01T10:00:00.000Z".to_string();
    store.write_container(&meta).unwrap();

    let supervisor =
        Supervisor::with_liveness(dir, ScriptedLiveness::new(vec![tracer_at(&rootfs)]));

    let rows = supervisor
        .ps(&PsOptions { all: true, ..Default::default() })
        .unwrap();
    assert_eq!(rows[0].name, "new", "sorted by StartedAt descending");
    assert_eq!(rows[0].id.len(), 12, "ids are rendered short");

    let rows = supervisor
        .ps(&PsOptions { all: true, latest: true, ..Default::default() })
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn test_ps_size_column() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    let rootfs = seed_container(&dir, "w1", &"88".repeat(32), ContainerStatus::Running, true, false);
    fs::write(rootfs.join("payload.bin"), vec![0u8; 2048]).unwrap();

    let supervisor =
        Supervisor::with_liveness(dir, ScriptedLiveness::new(vec![tracer_at(&rootfs)]));
    let rows = supervisor
        .ps(&PsOptions { all: true, size: true, ..Default::default() })
        .unwrap();
    assert!(rows[0].size.unwrap() >= 2048);
}

// =============================================================================
// rm
// =============================================================================

#[tokio::test]
async fn test_rm_running_without_force_is_in_use() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    let rootfs = seed_container(&dir, "w1", &"99".repeat(32), ContainerStatus::Running, true, false);

    let supervisor =
        Supervisor::with_liveness(dir.clone(), ScriptedLiveness::new(vec![tracer_at(&rootfs)]));
    let err = supervisor
        .rm(&["w1".to_string()], false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InUse(_)));
    assert!(dir.container_dir("w1").exists());
}

#[tokio::test]
async fn test_rm_force_stops_then_removes() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    let rootfs = seed_container(&dir, "w1", &"99".repeat(32), ContainerStatus::Running, true, false);

    // Alive for the rm check, gone once stop rescans.
    let supervisor = Supervisor::with_liveness(
        dir.clone(),
        ScriptedLiveness::new(vec![tracer_at(&rootfs), Vec::new()]),
    );
    let removed = supervisor.rm(&["w1".to_string()], true, false).await.unwrap();

    assert_eq!(removed, vec!["w1"]);
    assert!(!dir.container_dir("w1").exists());
}

#[tokio::test]
async fn test_rm_exited_without_force() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    seed_container(&dir, "w1", &"aa".repeat(32), ContainerStatus::Exited, false, false);

    let supervisor = Supervisor::with_liveness(dir.clone(), ScriptedLiveness::empty());
    supervisor.rm(&["w1".to_string()], false, false).await.unwrap();
    assert!(!dir.container_dir("w1").exists());
}

// =============================================================================
// logs
// =============================================================================

#[tokio::test]
async fn test_logs_tail_and_filters() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    seed_container(&dir, "w1", &"bb".repeat(32), ContainerStatus::Exited, false, false);
    fs::write(
        dir.container_log("w1"),
        "2024-05-01T10:00:00.000Z one\n2024-05-01T10:01:00.000Z two\n2024-05-01T10:02:00.000Z three\n",
    )
    .unwrap();

    let supervisor = Supervisor::with_liveness(dir, ScriptedLiveness::empty());

    let tail = supervisor
        .collect_logs("w1", &LogOptions { tail: Some(1), ..Default::default() })
        .unwrap();
    assert_eq!(tail.len(), 1);
    assert!(tail[0].ends_with("three"));

    let since = supervisor
        .collect_logs(
            "w1",
            &LogOptions {
                since: Some("2024-05-01T10:01".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(since.len(), 2);

    let until = supervisor
        .collect_logs(
            "w1",
            &LogOptions {
                until: Some("2024-05-01T10:00".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(until.len(), 1);
    assert!(until[0].ends_with("one"));
}

#[tokio::test]
async fn test_logs_details_dumps_metadata() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    seed_container(&dir, "w1", &"cc".repeat(32), ContainerStatus::Exited, false, false);

    let supervisor = Supervisor::with_liveness(dir, ScriptedLiveness::empty());
    let lines = supervisor
        .collect_logs("w1", &LogOptions { details: true, ..Default::default() })
        .unwrap();
    let joined = lines.join("\n");
    assert!(joined.contains("\"Name\": \"w1\""));
    assert!(joined.contains("\"Status\": \"exited\""));
}

#[tokio::test]
async fn test_logs_missing_file_is_empty() {
    let temp = TempDir::new().unwrap();
    let dir = data_dir(&temp);
    seed_container(&dir, "w1", &"dd".repeat(32), ContainerStatus::Created, false, false);

    let supervisor = Supervisor::with_liveness(dir, ScriptedLiveness::empty());
    let lines = supervisor.collect_logs("w1", &LogOptions::default()).unwrap();
    assert!(lines.is_empty());
}
