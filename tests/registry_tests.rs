//! Tests for the registry client's offline behavior: the local tier,
//! version resolution rules, URL construction, and push preconditions.

use proobox::builder::emit_artifact;
use proobox::metadata::{write_json_atomic, ImageContainerConfig, ImageMetadata, ImagePaths};
use proobox::paths::DataDir;
use proobox::registry::{latest_alpine_release, mirror_url, RegistryClient};
use proobox::Error;
use std::fs;
use tempfile::TempDir;

fn seed_local_image(dir: &DataDir, temp: &TempDir, repo: &str, version: &str) {
    let tree = temp.path().join("tree");
    fs::create_dir_all(tree.join("etc")).unwrap();
    fs::write(tree.join("etc/os-release"), format!("ID={}\n", repo)).unwrap();

    let artifact = dir.image_artifact(repo, version);
    emit_artifact(&tree, &artifact).unwrap();

    let meta = ImageMetadata {
        id: "ca".repeat(16),
        repo_tags: vec![format!("{}:{}", repo, version)],
        created: "2024-01-01T00:00:00.000Z".to_string(),
        size: fs::metadata(&artifact).unwrap().len(),
        virtual_size: "unknown".to_string(),
        container_config: ImageContainerConfig::default(),
        os: "linux".to_string(),
        architecture: "arm64".to_string(),
        paths: ImagePaths {
            image_path: artifact.to_string_lossy().to_string(),
        },
    };
    write_json_atomic(&dir.image_metadata(repo, version), &meta).unwrap();
}

// =============================================================================
// Local Tier
// =============================================================================

#[tokio::test]
async fn test_pull_hits_local_tier_without_network() {
    let temp = TempDir::new().unwrap();
    let dir = DataDir::with_base(temp.path().join("data")).unwrap();
    seed_local_image(&dir, &temp, "alpine", "3.20.0");

    let registry = RegistryClient::new(dir).unwrap();
    let (tag, meta) = registry.pull("alpine:3.20.0").await.unwrap();

    assert_eq!(tag.to_string(), "alpine:3.20.0");
    assert_eq!(meta.repo_tags, vec!["alpine:3.20.0"]);
}

#[tokio::test]
async fn test_pull_normalizes_version_before_lookup() {
    let temp = TempDir::new().unwrap();
    let dir = DataDir::with_base(temp.path().join("data")).unwrap();
    seed_local_image(&dir, &temp, "ubuntu", "22.04.0");

    let registry = RegistryClient::new(dir).unwrap();
    let (tag, _) = registry.pull("ubuntu:22.04").await.unwrap();
    assert_eq!(tag.version, "22.04.0");
}

// =============================================================================
// Version Resolution Rules
// =============================================================================

#[tokio::test]
async fn test_pull_without_version_requires_it_for_ubuntu() {
    let temp = TempDir::new().unwrap();
    let dir = DataDir::with_base(temp.path().join("data")).unwrap();

    let registry = RegistryClient::new(dir).unwrap();
    let err = registry.pull("ubuntu").await.unwrap_err();
    assert!(matches!(err, Error::VersionRequired { .. }), "got: {}", err);
}

#[tokio::test]
async fn test_pull_without_version_requires_it_for_user_images() {
    let temp = TempDir::new().unwrap();
    let dir = DataDir::with_base(temp.path().join("data")).unwrap();

    let registry = RegistryClient::new(dir).unwrap();
    let err = registry.pull("myapp").await.unwrap_err();
    assert!(matches!(err, Error::VersionRequired { .. }));
}

#[test]
fn test_latest_alpine_release_semver_sort() {
    let html = concat!(
        "<a href=\"v2.7/\">v2.7/</a>\n",
        "<a href=\"v3.10/\">v3.10/</a>\n",
        "<a href=\"v3.9/\">v3.9/</a>\n",
        "<a href=\"latest-stable/\">latest-stable/</a>\n",
    );
    // 3.10 > 3.9 numerically, even though "3.9" > "3.10" as strings.
    assert_eq!(latest_alpine_release(html).as_deref(), Some("3.10"));
}

// =============================================================================
// Mirror URLs
// =============================================================================

#[test]
fn test_mirror_urls_for_known_distros() {
    assert_eq!(
        mirror_url("alpine", "3.20.0", "aarch64").unwrap(),
        "https://dl-cdn.alpinelinux.org/alpine/v3.20/releases/aarch64/alpine-minirootfs-3.20.0-aarch64.tar.gz"
    );
    assert_eq!(
        mirror_url("ubuntu", "24.04.1", "arm64").unwrap(),
        "http://cdimage.ubuntu.com/ubuntu-base/releases/24.04.1/release/ubuntu-base-24.04.1-base-arm64.tar.gz"
    );
}

#[test]
fn test_no_mirror_for_user_images() {
    let err = mirror_url("myapp", "1.0.0", "arm64").unwrap_err();
    assert!(matches!(err, Error::ImageNotFound { .. }));
}

// =============================================================================
// Push Preconditions
// =============================================================================

#[tokio::test]
async fn test_push_without_backend_config_fails() {
    let temp = TempDir::new().unwrap();
    let dir = DataDir::with_base(temp.path().join("data")).unwrap();
    seed_local_image(&dir, &temp, "myapp", "1.0.0");

    let registry = RegistryClient::new(dir).unwrap();
    let err = registry.push("myapp:1.0.0").await.unwrap_err();
    assert!(matches!(err, Error::Invalid(_)), "got: {}", err);
}

#[tokio::test]
async fn test_push_unknown_image_fails_before_network() {
    let temp = TempDir::new().unwrap();
    let dir = DataDir::with_base(temp.path().join("data")).unwrap();
    fs::write(
        dir.config_path(),
        r#"{"backend":{"url":"http://127.0.0.1:1","username":"u","token":"t"}}"#,
    )
    .unwrap();

    let registry = RegistryClient::new(dir).unwrap();
    let err = registry.push("ghost:1.0.0").await.unwrap_err();
    assert!(matches!(err, Error::ImageNotFound { .. }), "got: {}", err);
}
