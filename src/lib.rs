//! # proobox
//!
//! **Rootless, user-mode container manager for single-user mobile/Unix
//! environments.**
//!
//! proobox provides a container experience (pull base images, run isolated
//! root filesystems, build layered images from a declarative recipe, manage
//! container lifecycles, push and pull to a user registry) without kernel
//! namespaces or privileged mounts. Isolation comes from a path-translating
//! tracer that remaps the guest's view of the filesystem onto a synthesized
//! root while bind-mounting selected host paths.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           proobox                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Supervisor                     Builder                         │
//! │  run/start/stop/restart         recipe → cache-keyed steps →    │
//! │  exec/logs/ps/rm                tar.gz artifact + metadata      │
//! │        │                              │                         │
//! │  ┌─────┴─────────┐            ┌───────┴───────┐                 │
//! │  │ TracerCommand │            │  LayerCache   │                 │
//! │  │ (argv vector) │            │ (hash chain)  │                 │
//! │  └───────────────┘            └───────────────┘                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ImageStore ── RegistryClient (local → user registry → mirror)  │
//! │  MetadataStore (atomic JSON records)   Liveness (/proc scan)    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!   ┌─────────┐   run/start   ┌─────────┐   exit/stop   ┌────────┐
//!   │ created │ ────────────► │ running │ ────────────► │ exited │ ──rm──► (gone)
//!   └─────────┘               └─────────┘               └────────┘
//! ```
//!
//! `running` is never taken on faith: the process table is scanned for a
//! tracer rooted at the container's rootfs, and stale records are reconciled
//! on the next `ps` or `stop`.
//!
//! # Example
//!
//! ```rust,ignore
//! use proobox::{DataDir, RunOptions, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> proobox::Result<()> {
//!     let dir = DataDir::new()?;
//!     let supervisor = Supervisor::new(dir);
//!
//!     let id = supervisor
//!         .run("alpine:3.20.0", RunOptions {
//!             name: Some("web".to_string()),
//!             detach: true,
//!             command: vec!["sleep".to_string(), "3600".to_string()],
//!             ..Default::default()
//!         })
//!         .await?;
//!
//!     println!("{}", id);
//!     Ok(())
//! }
//! ```

// =============================================================================
// Modules
// =============================================================================

pub mod builder;
pub mod config;
pub mod constants;
pub mod error;
pub mod layers;
pub mod liveness;
pub mod metadata;
pub mod paths;
pub mod recipe;
pub mod registry;
pub mod rootfs;
pub mod store;
pub mod supervisor;
pub mod tracer;

// =============================================================================
// Facade Re-exports
// =============================================================================

pub use builder::Builder;
pub use config::{BackendConfig, Config};
pub use error::{Error, Result};
pub use layers::LayerCache;
pub use liveness::{Liveness, ProcScanner, TracerProcess};
pub use metadata::{ContainerMetadata, ContainerStatus, ImageMetadata, MetadataStore};
pub use paths::DataDir;
pub use recipe::{Directive, Recipe};
pub use registry::RegistryClient;
pub use store::{ImageStore, Tag};
pub use supervisor::{
    ContainerSummary, ExecOptions, LogOptions, PsOptions, RunOptions, Supervisor,
};
pub use tracer::TracerCommand;
