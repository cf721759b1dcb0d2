//! Tests for metadata records and the atomic store.
//!
//! Validates the bit-exact JSON shape, atomic replacement, partial state
//! updates, and name/short-id resolution.

use proobox::metadata::{
    write_json_atomic, ContainerConfig, ContainerMetadata, ContainerPaths, ContainerState,
    ContainerStatus, HostConfig, ImageRef, MetadataStore, NetworkSettings,
};
use proobox::paths::DataDir;
use proobox::Error;
use tempfile::TempDir;

fn sample_container(name: &str, id: &str) -> ContainerMetadata {
    ContainerMetadata {
        id: id.to_string(),
        name: name.to_string(),
        image: ImageRef {
            name: "alpine:3.20.0".to_string(),
            id: "deadbeef".repeat(4),
        },
        state: ContainerState {
            status: ContainerStatus::Created,
            running: false,
            detached_original: false,
            interactive_original: true,
            started_at: String::new(),
            finished_at: String::new(),
            exit_code: 0,
        },
        config: ContainerConfig {
            hostname: name.to_string(),
            domainname: String::new(),
            user: "root".to_string(),
            env: vec!["PATH=/usr/bin".to_string()],
            cmd: Some(vec!["/bin/sh".to_string()]),
            image: "alpine:3.20.0".to_string(),
            working_dir: "/root".to_string(),
            entrypoint: None,
            healthcheck: None,
        },
        host_config: HostConfig {
            binds: vec![],
            auto_remove: false,
        },
        mounts: vec![],
        network_settings: NetworkSettings::default(),
        paths: ContainerPaths {
            rootfs_path: format!("/data/containers/{}/rootfs", name),
            log_file: None,
            image_path: "/data/images/alpine-3.20.0.tar.gz".to_string(),
        },
    }
}

fn store() -> (TempDir, MetadataStore) {
    let temp = TempDir::new().unwrap();
    let dir = DataDir::with_base(temp.path().join("data")).unwrap();
    (temp, MetadataStore::new(dir))
}

// =============================================================================
// JSON Shape
// =============================================================================

#[test]
fn test_container_record_field_names() {
    let meta = sample_container("web", &"ab".repeat(32));
    let json = serde_json::to_value(&meta).unwrap();

    assert!(json.get("Id").is_some());
    assert!(json.get("Name").is_some());
    assert!(json["Image"].get("Name").is_some());
    assert!(json["State"].get("DetachedOriginal").is_some());
    assert!(json["State"].get("InteractiveOriginal").is_some());
    assert_eq!(json["State"]["Status"], "created");
    assert_eq!(json["Config"]["User"], "root");
    assert!(json["Config"]["Entrypoint"].is_null());
    assert!(json["Config"]["Healthcheck"].is_null());
    assert_eq!(json["NetworkSettings"]["IPAddress"], "");
    assert!(json["NetworkSettings"]["Ports"].as_object().unwrap().is_empty());
    assert!(json["Paths"]["LogFile"].is_null());
}

#[test]
fn test_container_record_roundtrip_preserves_shape() {
    let meta = sample_container("web", &"ab".repeat(32));
    let json = serde_json::to_string_pretty(&meta).unwrap();
    let parsed: ContainerMetadata = serde_json::from_str(&json).unwrap();
    let rewritten = serde_json::to_string_pretty(&parsed).unwrap();
    assert_eq!(json, rewritten, "read-then-write must be lossless");
}

#[test]
fn test_null_cmd_accepted() {
    let mut meta = sample_container("web", &"ab".repeat(32));
    meta.config.cmd = None;
    let json = serde_json::to_value(&meta).unwrap();
    assert!(json["Config"]["Cmd"].is_null());

    let parsed: ContainerMetadata = serde_json::from_value(json).unwrap();
    assert!(parsed.config.cmd.is_none());
}

// =============================================================================
// Atomic Writes
// =============================================================================

#[test]
fn test_write_then_read() {
    let (_temp, store) = store();
    let meta = sample_container("web", &"ab".repeat(32));

    store.write_container(&meta).unwrap();
    let read = store.read_container("web").unwrap();

    assert_eq!(read.id, meta.id);
    assert_eq!(read.config.cmd, meta.config.cmd);
}

#[test]
fn test_write_leaves_no_temp_files() {
    let (_temp, store) = store();
    let meta = sample_container("web", &"ab".repeat(32));
    store.write_container(&meta).unwrap();
    store.write_container(&meta).unwrap();

    let dir = store.data_dir().container_dir("web");
    let leftovers: Vec<_> = std::fs::read_dir(&dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains("tmp"))
        .collect();
    assert!(leftovers.is_empty(), "temp files must be renamed away");
}

#[test]
fn test_atomic_write_plain_value() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("nested").join("out.json");

    write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("\"a\": 1"));
}

// =============================================================================
// State Updates
// =============================================================================

#[test]
fn test_update_state_touches_only_named_fields() {
    let (_temp, store) = store();
    let mut meta = sample_container("web", &"ab".repeat(32));
    meta.state.started_at = "2024-05-01T10:00:00.000Z".to_string();
    store.write_container(&meta).unwrap();

    store
        .update_state(
            "web",
            ContainerStatus::Exited,
            false,
            Some("2024-05-01T10:05:00.000Z".to_string()),
            Some(137),
        )
        .unwrap();

    let read = store.read_container("web").unwrap();
    assert_eq!(read.state.status, ContainerStatus::Exited);
    assert_eq!(read.state.exit_code, 137);
    assert_eq!(read.state.finished_at, "2024-05-01T10:05:00.000Z");
    // Untouched fields survive.
    assert_eq!(read.state.started_at, "2024-05-01T10:00:00.000Z");
    assert!(read.state.interactive_original);
    assert_eq!(read.config.env, vec!["PATH=/usr/bin".to_string()]);
}

// =============================================================================
// Resolution
// =============================================================================

#[test]
fn test_resolve_by_name() {
    let (_temp, store) = store();
    store.write_container(&sample_container("web", &"ab".repeat(32))).unwrap();

    let meta = store.resolve("web").unwrap();
    assert_eq!(meta.name, "web");
}

#[test]
fn test_resolve_by_short_id_prefix() {
    let (_temp, store) = store();
    let id = format!("abcd{}", "0".repeat(60));
    store.write_container(&sample_container("web", &id)).unwrap();

    let meta = store.resolve("abcd").unwrap();
    assert_eq!(meta.name, "web");
}

#[test]
fn test_resolve_ambiguous_prefix_fails() {
    let (_temp, store) = store();
    store
        .write_container(&sample_container("a1", &format!("abcd1{}", "0".repeat(59))))
        .unwrap();
    store
        .write_container(&sample_container("a2", &format!("abcd2{}", "0".repeat(59))))
        .unwrap();

    let err = store.resolve("abcd").unwrap_err();
    assert!(matches!(err, Error::Ambiguous { count: 2, .. }));
}

#[test]
fn test_resolve_longer_prefix_disambiguates() {
    let (_temp, store) = store();
    store
        .write_container(&sample_container("a1", &format!("abcd1{}", "0".repeat(59))))
        .unwrap();
    store
        .write_container(&sample_container("a2", &format!("abcd2{}", "0".repeat(59))))
        .unwrap();

    let meta = store.resolve("abcd2").unwrap();
    assert_eq!(meta.name, "a2");
}

#[test]
fn test_resolve_unknown_fails_not_found() {
    let (_temp, store) = store();
    let err = store.resolve("nope").unwrap_err();
    assert!(matches!(err, Error::ContainerNotFound(_)));
}

#[test]
fn test_too_short_prefix_is_a_name_lookup() {
    let (_temp, store) = store();
    store
        .write_container(&sample_container("web", &format!("abc{}", "0".repeat(61))))
        .unwrap();

    // Three hex chars is below the prefix minimum, so this is treated as a
    // (missing) name.
    let err = store.resolve("abc").unwrap_err();
    assert!(matches!(err, Error::ContainerNotFound(_)));
}
