//! Backend configuration (`$BASE/config.json`).
//!
//! The config file is optional: without it the user-registry pull tier and
//! push are disabled and pulls fall through to the upstream mirrors. Only
//! the `backend` keys below are recognized; anything else is ignored so old
//! binaries keep reading configs written by newer ones.

use crate::error::Result;
use crate::paths::DataDir;
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::debug;

/// Registry backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the registry backend, e.g. `http://host:8000`.
    pub url: String,
    /// Account name used in download/upload paths.
    pub username: String,
    /// Bearer token for uploads.
    pub token: String,
}

/// Top-level config file shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Registry backend, when configured.
    pub backend: Option<BackendConfig>,
}

impl Config {
    /// Loads the config from the data directory. A missing file yields the
    /// default (no backend); a present-but-unreadable file is an error.
    pub fn load(dir: &DataDir) -> Result<Self> {
        let path = dir.config_path();
        if !path.exists() {
            debug!("no config at {}, registry backend disabled", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Returns the backend settings, if configured.
    pub fn backend(&self) -> Option<&BackendConfig> {
        self.backend.as_ref()
    }
}
