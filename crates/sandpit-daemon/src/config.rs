//! Daemon configuration

use sandpit_core::EngineConfig;
use sandpit_core::protocol::MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Configuration for the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to Unix socket
    pub socket_path: PathBuf,

    /// Largest request frame accepted from a client
    pub max_frame_bytes: usize,

    /// Execution engine settings
    pub engine: EngineConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: sandpit_core::config::default_socket_path(),
            max_frame_bytes: MAX_FRAME_BYTES,
            engine: EngineConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load from a TOML file; keys it leaves out keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults, or the file at `path` when one is given.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }
}
