//! Engine configuration

use crate::Language;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Largest accepted source submission, in bytes
pub const MAX_CODE_BYTES: usize = 50_000;

/// Largest accepted stdin payload, in bytes
pub const MAX_INPUT_BYTES: usize = 10_000;

/// Configuration for an [`crate::ExecutionEngine`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum source size in bytes
    pub max_code_bytes: usize,

    /// Maximum stdin size in bytes
    pub max_input_bytes: usize,

    /// Per-stream cap on captured output; the rest is discarded
    pub max_output_bytes: usize,

    /// How long a stop waits before the runtime force-kills the container
    pub stop_grace_secs: u64,

    /// Pull an image once when container creation reports it missing
    pub auto_pull_images: bool,

    /// Languages removed from the profile table
    pub disabled_languages: Vec<Language>,

    /// Per-language container image replacements
    pub image_overrides: BTreeMap<Language, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_code_bytes: MAX_CODE_BYTES,
            max_input_bytes: MAX_INPUT_BYTES,
            max_output_bytes: 1024 * 1024, // 1MB
            stop_grace_secs: 5,
            auto_pull_images: true,
            disabled_languages: Vec::new(),
            image_overrides: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    #[must_use]
    pub const fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Builder for `EngineConfig`
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    #[must_use]
    pub const fn max_code_bytes(mut self, bytes: usize) -> Self {
        self.config.max_code_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn max_input_bytes(mut self, bytes: usize) -> Self {
        self.config.max_input_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.config.max_output_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn stop_grace_secs(mut self, secs: u64) -> Self {
        self.config.stop_grace_secs = secs;
        self
    }

    #[must_use]
    pub const fn auto_pull_images(mut self, pull: bool) -> Self {
        self.config.auto_pull_images = pull;
        self
    }

    #[must_use]
    pub fn disable_language(mut self, language: Language) -> Self {
        self.config.disabled_languages.push(language);
        self
    }

    #[must_use]
    pub fn image_override(mut self, language: Language, image: impl Into<String>) -> Self {
        self.config.image_overrides.insert(language, image.into());
        self
    }

    #[must_use]
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

/// Get default socket path from SANDPIT_SOCKET env var or system default
///
/// Returns:
/// - `$SANDPIT_SOCKET` if set (for development)
/// - `/run/sandpit/sandpit.sock` otherwise (production)
pub fn default_socket_path() -> PathBuf {
    std::env::var("SANDPIT_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/sandpit/sandpit.sock"))
}
