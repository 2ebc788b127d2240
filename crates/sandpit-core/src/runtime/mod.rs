//! Container runtime abstraction
//!
//! - `docker` - Docker Engine API backend (bollard)
//! - `mock` - scripted in-memory backend for tests and dry runs

pub mod docker;
pub mod mock;

pub use self::docker::DockerRuntime;
pub use self::mock::{MockProgram, MockRuntime};

use crate::error::RuntimeError;
use crate::profile::Ulimit;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;

/// Which output stream a chunk was written to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A piece of program output tagged with its stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn stdout(data: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: StreamKind::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: StreamKind::Stderr,
            data: data.into(),
        }
    }
}

/// Combined output of an attached container, ends when the container exits
pub type OutputStream = BoxStream<'static, Result<OutputChunk, RuntimeError>>;

/// Runtime-neutral description of a container to create
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    /// `KEY=value` pairs
    pub env: Vec<String>,
    pub user: String,
    pub working_dir: String,
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub pids_limit: i64,
    /// Network mode, `none` for every sandbox
    pub network_mode: String,
    pub read_only_root: bool,
    /// Mount point -> tmpfs options
    pub tmpfs: HashMap<String, String>,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub ulimits: Vec<Ulimit>,
    /// Keep stdin open so input can be streamed in after attach
    pub open_stdin: bool,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Value of an environment variable in the spec.
    #[must_use]
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|kv| {
            kv.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }
}

/// The operations the engine needs from a container runtime.
///
/// Implementations report "no such container" as [`RuntimeError::NotFound`]
/// and "already stopped" as [`RuntimeError::NotModified`] so cleanup can
/// treat both as success.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container, returning its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Fetch an image so a subsequent create can succeed.
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Attach to the container's output, feeding `stdin` (then EOF) if given.
    async fn attach(
        &self,
        container_id: &str,
        stdin: Option<Vec<u8>>,
    ) -> Result<OutputStream, RuntimeError>;

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Wait for the container to exit and return its exit status.
    async fn wait(&self, container_id: &str) -> Result<i64, RuntimeError>;

    /// Force-terminate immediately.
    async fn kill(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Ask the container to stop, force-killing after `grace`.
    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// Remove the container and its anonymous volumes.
    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError>;
}
