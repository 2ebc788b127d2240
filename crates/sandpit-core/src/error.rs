//! Error types for sandpit-core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the execution engine.
///
/// A program that exits non-zero, crashes or times out is *not* an engine
/// error; it comes back as a normal [`crate::ExecutionResult`].
#[derive(Error, Debug)]
pub enum EngineError {
    /// Request validation or static screening rejected the submission.
    /// Always raised before any sandbox exists.
    #[error("security violation: {}", .violations.join("; "))]
    Security { violations: Vec<String> },

    /// The sandbox could not be provisioned.
    #[error("resource limit error: {message}")]
    ResourceLimit {
        message: String,
        #[source]
        source: Option<RuntimeError>,
    },

    /// The container runtime failed while starting or awaiting the program.
    #[error("execution error: {message}")]
    ExecutionTimeout {
        message: String,
        #[source]
        source: RuntimeError,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub fn security(violation: impl Into<String>) -> Self {
        Self::Security {
            violations: vec![violation.into()],
        }
    }

    pub fn resource_limit(message: impl Into<String>) -> Self {
        Self::ResourceLimit {
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Security { .. } => ErrorKind::Security,
            Self::ResourceLimit { .. } => ErrorKind::ResourceLimit,
            Self::ExecutionTimeout { .. } => ErrorKind::ExecutionTimeout,
            Self::Config(_) => ErrorKind::Internal,
        }
    }
}

/// Category of an engine failure, as reported over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Security,
    ResourceLimit,
    ExecutionTimeout,
    Internal,
}

/// Failures reported by a [`crate::runtime::ContainerRuntime`].
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("no such container or image: {0}")]
    NotFound(String),

    #[error("container already stopped: {0}")]
    NotModified(String),

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("container runtime returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    /// True when the target is already stopped or removed. Cleanup treats
    /// this as success.
    #[must_use]
    pub const fn is_gone(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::NotModified(_))
    }
}
