//! Registry of live sandboxes
//!
//! The only shared mutable state in the engine. Each engine owns its own
//! registry; nothing here is global.

use crate::reaper::Reaper;
use crate::{Sandbox, SandboxId, SandboxStatus};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct SandboxRegistry {
    sandboxes: Mutex<HashMap<SandboxId, Sandbox>>,
}

impl SandboxRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly provisioned sandbox. Returns false if the id was
    /// already present, in which case nothing changes.
    pub fn register(&self, sandbox: Sandbox) -> bool {
        let mut sandboxes = self.sandboxes.lock();
        if sandboxes.contains_key(&sandbox.id) {
            return false;
        }
        tracing::debug!(sandbox_id = %sandbox.id, container_id = %sandbox.container_id, "sandbox registered");
        sandboxes.insert(sandbox.id, sandbox);
        true
    }

    /// Take a sandbox out of the registry. Only one caller ever gets
    /// `Some` for a given id.
    pub fn remove(&self, id: &SandboxId) -> Option<Sandbox> {
        self.sandboxes.lock().remove(id)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sandboxes.lock().len()
    }

    #[must_use]
    pub fn get(&self, id: &SandboxId) -> Option<Sandbox> {
        self.sandboxes.lock().get(id).cloned()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<SandboxId> {
        self.sandboxes.lock().keys().copied().collect()
    }

    /// Move a sandbox to `status` if the state machine allows it.
    pub fn set_status(&self, id: &SandboxId, status: SandboxStatus) -> bool {
        let mut sandboxes = self.sandboxes.lock();
        match sandboxes.get_mut(id) {
            Some(sandbox) if sandbox.status.can_become(status) => {
                sandbox.status = status;
                sandbox.last_used = Utc::now();
                true
            }
            Some(sandbox) => {
                tracing::warn!(
                    sandbox_id = %id,
                    from = ?sandbox.status,
                    to = ?status,
                    "ignoring invalid sandbox status transition"
                );
                false
            }
            None => false,
        }
    }

    /// Reap every registered sandbox, each independently. Failures are
    /// logged and do not stop the sweep. Returns how many were torn down
    /// without error.
    pub async fn cleanup_all(&self, reaper: &Reaper) -> usize {
        let ids = self.ids();
        if ids.is_empty() {
            return 0;
        }
        tracing::info!(count = ids.len(), "reaping all sandboxes");

        let results = futures::future::join_all(ids.iter().map(|id| reaper.reap(id))).await;
        let mut reaped = 0;
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(()) => reaped += 1,
                Err(e) => tracing::error!(sandbox_id = %id, error = %e, "sandbox cleanup failed"),
            }
        }
        reaped
    }
}
