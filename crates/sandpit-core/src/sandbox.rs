//! Sandbox identity and lifecycle state
//!
//! A sandbox is `running` from provisioning until its program finishes or
//! is killed, then `stopped`; runtime failures move it to `error`.

use crate::Language;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of a provisioned sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SandboxId(Uuid);

impl SandboxId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Container name derived from the id.
    #[must_use]
    pub fn container_name(&self) -> String {
        format!("sandpit-{}", self.0.simple())
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Provisioned, program not yet finished
    Running,
    /// Program finished or was killed on timeout
    Stopped,
    /// The runtime failed underneath the program
    Error,
}

impl SandboxStatus {
    /// `running` may move to `stopped` or `error`; nothing leaves those.
    #[must_use]
    pub const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Running, Self::Stopped | Self::Error)
        )
    }
}

/// One provisioned, isolated environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: SandboxId,
    /// Handle of the backing container
    pub container_id: String,
    pub language: Language,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub status: SandboxStatus,
}

impl Sandbox {
    #[must_use]
    pub fn new(id: SandboxId, container_id: String, language: Language) -> Self {
        let now = Utc::now();
        Self {
            id,
            container_id,
            language,
            created_at: now,
            last_used: now,
            status: SandboxStatus::Running,
        }
    }
}
