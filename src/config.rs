//! Configuration Module
//!
//! YAML configuration for the `layerfs` tool: which block store backend to
//! open, the default layer stack for new blocksets, the per-call timeout and
//! where metadata is kept.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layer_spec::BlockLayerSpec;

/// Errors that can occur while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Which block store backend to open and where
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStoreConfig {
    /// Backend name as registered in the block store registry
    pub backend: String,
    /// Root directory for backends that persist to disk
    pub root: PathBuf,
}

impl BlockStoreConfig {
    pub fn memory() -> Self {
        Self {
            backend: "memory".to_string(),
            root: PathBuf::new(),
        }
    }

    pub fn file<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            backend: "file".to_string(),
            root: root.into(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerfsConfig {
    pub store: BlockStoreConfig,

    /// Layer spec used when a blockset is created without one
    #[serde(default = "default_layer_spec")]
    pub default_layer_spec: String,

    /// Timeout applied to every block store and metadata call
    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,

    /// Key prefix under which blocksets are stored in the metadata store
    #[serde(default = "default_metadata_prefix")]
    pub metadata_prefix: String,

    /// Local snapshot of the metadata store
    pub blockset_state_path: PathBuf,
}

fn default_layer_spec() -> String {
    "crc,base".to_string()
}

fn default_metadata_prefix() -> String {
    "/layerfs".to_string()
}

impl LayerfsConfig {
    /// Configuration with the file backend under `data/`
    pub fn new() -> Self {
        Self {
            store: BlockStoreConfig::file("data/blocks"),
            default_layer_spec: default_layer_spec(),
            operation_timeout_ms: Some(30_000),
            metadata_prefix: default_metadata_prefix(),
            blockset_state_path: PathBuf::from("data/metadata.json"),
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.store.backend.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "store.backend must not be empty".to_string(),
            });
        }

        if let Err(e) = BlockLayerSpec::parse(&self.default_layer_spec) {
            return Err(ConfigError::Invalid {
                reason: format!("default_layer_spec: {}", e),
            });
        }

        if self.operation_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                reason: "operation_timeout_ms must be greater than 0".to_string(),
            });
        }

        if self.metadata_prefix.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "metadata_prefix must not be empty".to_string(),
            });
        }

        Ok(())
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for LayerfsConfig {
    fn default() -> Self {
        Self::new()
    }
}
