//! Engine configuration

use std::path::{Path, PathBuf};

use boundary_kernel::arbiter::OverlayCaps;
use serde::{Deserialize, Serialize};

/// Highest bundle version this build can import.
pub const SUPPORTED_BUNDLE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum simultaneous overlays per layer
    #[serde(default)]
    pub overlay_caps: OverlayCaps,

    /// Bound on re-entrant evaluation after a commit
    #[serde(default = "default_max_cascade_depth")]
    pub max_cascade_depth: usize,

    /// Quota applied to the built-in stores (unbounded when absent)
    #[serde(default)]
    pub storage_quota_bytes: Option<usize>,

    /// Directory for the file-backed store
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Version written into exported bundles
    #[serde(default = "default_bundle_version")]
    pub bundle_version: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            overlay_caps: OverlayCaps::default(),
            max_cascade_depth: default_max_cascade_depth(),
            storage_quota_bytes: None,
            data_dir: None,
            bundle_version: default_bundle_version(),
        }
    }
}

fn default_max_cascade_depth() -> usize { 8 }
fn default_bundle_version() -> u32 { SUPPORTED_BUNDLE_VERSION }

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {message}")]
    Read { path: String, message: String },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }
}
