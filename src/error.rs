//! Error types for the container engine.

use std::path::PathBuf;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the container engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Input Errors
    // =========================================================================
    /// Bad flag combination or malformed user input.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// A distro version is required but was not supplied.
    #[error("a version is required for '{distro}': try '{distro}:<version>'")]
    VersionRequired { distro: String },

    /// The host architecture has no known mapping.
    #[error("unsupported host architecture: {arch}")]
    ArchUnsupported { arch: String },

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    /// Image not found locally or in any registry tier.
    #[error("image not found: {reference}")]
    ImageNotFound { reference: String },

    /// Container not found by name or short id.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// A short-id prefix matched more than one stored identifier.
    #[error("ambiguous id prefix '{prefix}': matches {count} entries, use more characters")]
    Ambiguous { prefix: String, count: usize },

    /// A container with this name already exists.
    #[error("container name already in use: {0}")]
    AlreadyExists(String),

    /// Removal was refused because the container is running.
    #[error("container '{0}' is running: stop it first or use --force")]
    InUse(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// A network operation failed.
    #[error("network request failed for {url}: {reason}")]
    NetworkFailed { url: String, reason: String },

    /// Artifact extraction failed.
    #[error("failed to extract {archive}: {reason}")]
    ExtractFailed { archive: PathBuf, reason: String },

    /// Metadata could not be written even through the copy fallback.
    #[error("failed to write metadata at {path}: {reason}")]
    MetadataWriteFailed { path: PathBuf, reason: String },

    /// Metadata exists but could not be parsed.
    #[error("malformed metadata at {path}: {reason}")]
    MetadataMalformed { path: PathBuf, reason: String },

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// The tracer could not be spawned.
    #[error("failed to spawn tracer for '{container}': {reason}")]
    SpawnFailed { container: String, reason: String },

    /// A build step exited non-zero; the step log is embedded.
    #[error("build step {step} failed with exit code {code}\n{log}")]
    BuildFailed { step: usize, code: i32, log: String },

    /// The container survived the TERM/KILL escalation.
    #[error("failed to stop container '{0}': still running after SIGKILL")]
    StopFailed(String),

    // =========================================================================
    // Wrapped I/O
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
