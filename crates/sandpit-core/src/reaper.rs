//! Sandbox teardown
//!
//! Teardown is claimed through [`SandboxRegistry::remove`]: whoever takes
//! the entry out tears the container down, everyone else sees `None` and
//! treats the sandbox as already gone. A [`SandboxLease`] ties a sandbox to
//! a scope so that every exit path, including cancellation, ends in a reap.
//!
//! A claimed sandbox stays on the reaper's unfinished list until its
//! container is confirmed gone. Teardowns that fail or are cancelled midway
//! are retried by [`Reaper::reap_all`].

use crate::error::RuntimeError;
use crate::registry::SandboxRegistry;
use crate::runtime::ContainerRuntime;
use crate::{Language, SandboxId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinSet;

/// Stops and removes sandbox containers, exactly once each
pub struct Reaper {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<SandboxRegistry>,
    grace: Duration,
    /// Claimed sandboxes whose container is not confirmed gone
    unfinished: Mutex<HashMap<SandboxId, String>>,
    /// Reaps scheduled by dropped leases
    background: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for Reaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaper")
            .field("grace", &self.grace)
            .field("registered", &self.registry.count())
            .field("unfinished", &self.unfinished.lock().len())
            .finish_non_exhaustive()
    }
}

impl Reaper {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<SandboxRegistry>,
        grace: Duration,
    ) -> Self {
        Self {
            runtime,
            registry,
            grace,
            unfinished: Mutex::new(HashMap::new()),
            background: Mutex::new(JoinSet::new()),
        }
    }

    /// Deregister the sandbox, then stop and remove its container.
    ///
    /// Already-reaped sandboxes and containers the runtime no longer knows
    /// about count as success. On failure the container stays on the
    /// unfinished list.
    pub async fn reap(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        let Some(sandbox) = self.registry.remove(id) else {
            tracing::trace!(sandbox_id = %id, "already reaped");
            return Ok(());
        };
        let container_id = sandbox.container_id;
        self.unfinished.lock().insert(*id, container_id.clone());

        self.teardown(id, &container_id).await?;
        self.unfinished.lock().remove(id);
        Ok(())
    }

    async fn teardown(&self, id: &SandboxId, container_id: &str) -> Result<(), RuntimeError> {
        match self.runtime.stop(container_id, self.grace).await {
            Ok(()) => {}
            Err(e) if e.is_gone() => {}
            // remove is forced, so a failed stop is not fatal
            Err(e) => {
                tracing::warn!(sandbox_id = %id, %container_id, error = %e, "stop failed");
            }
        }

        match self.runtime.remove(container_id).await {
            Ok(()) => {
                tracing::debug!(sandbox_id = %id, %container_id, "sandbox reaped");
                Ok(())
            }
            Err(e) if e.is_gone() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// [`Self::reap`], logging instead of returning the failure.
    pub async fn reap_logged(&self, id: &SandboxId) {
        if let Err(e) = self.reap(id).await {
            tracing::error!(sandbox_id = %id, error = %e, "failed to remove sandbox container");
        }
    }

    /// Schedule [`Self::reap`] on `handle`, tracked so [`Self::reap_all`]
    /// can wait for it.
    fn reap_in_background(self: &Arc<Self>, id: SandboxId, handle: &Handle) {
        let reaper = Arc::clone(self);
        let mut background = self.background.lock();
        while background.try_join_next().is_some() {}
        background.spawn_on(async move { reaper.reap_logged(&id).await }, handle);
    }

    /// Wait for every background reap scheduled so far.
    pub async fn settle(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.background.lock());
            if pending.is_empty() {
                return;
            }
            while pending.join_next().await.is_some() {}
        }
    }

    /// Retry teardown of every sandbox whose reap failed or was cut short.
    /// Returns how many containers are now confirmed gone.
    pub async fn retry_unfinished(&self) -> usize {
        let pending: Vec<(SandboxId, String)> = self
            .unfinished
            .lock()
            .iter()
            .map(|(id, container_id)| (*id, container_id.clone()))
            .collect();

        let mut reaped = 0;
        for (id, container_id) in pending {
            match self.teardown(&id, &container_id).await {
                Ok(()) => {
                    self.unfinished.lock().remove(&id);
                    reaped += 1;
                }
                Err(e) => {
                    tracing::error!(sandbox_id = %id, %container_id, error = %e, "retried teardown failed");
                }
            }
        }
        reaped
    }

    /// Reap everything this reaper is responsible for: background reaps
    /// first, then every registered sandbox, then the unfinished list.
    pub async fn reap_all(&self) -> usize {
        self.settle().await;
        let reaped = self.registry.cleanup_all(self).await;
        reaped + self.retry_unfinished().await
    }

    /// Sandboxes claimed for teardown whose container may still exist.
    #[must_use]
    pub fn unfinished_count(&self) -> usize {
        self.unfinished.lock().len()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }
}

/// Scoped ownership of one provisioned sandbox.
///
/// Call [`SandboxLease::release`] when done. A lease dropped without it
/// (early return, panic unwinding, a cancelled future) schedules the reap on
/// the current Tokio runtime instead.
#[derive(Debug)]
pub struct SandboxLease {
    id: SandboxId,
    container_id: String,
    language: Language,
    reaper: Arc<Reaper>,
    released: bool,
}

impl SandboxLease {
    pub(crate) fn new(
        id: SandboxId,
        container_id: String,
        language: Language,
        reaper: Arc<Reaper>,
    ) -> Self {
        Self {
            id,
            container_id,
            language,
            reaper,
            released: false,
        }
    }

    #[must_use]
    pub const fn id(&self) -> SandboxId {
        self.id
    }

    #[must_use]
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    #[must_use]
    pub const fn language(&self) -> Language {
        self.language
    }

    /// Tear the sandbox down now. Failures are logged, never returned.
    pub async fn release(mut self) {
        self.released = true;
        self.reaper.reap_logged(&self.id).await;
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(sandbox_id = %id, "lease dropped, reaping in background");
                self.reaper.reap_in_background(id, &handle);
            }
            Err(_) => {
                tracing::error!(
                    sandbox_id = %id,
                    container_id = %self.container_id,
                    "lease dropped outside a runtime, container leaked"
                );
            }
        }
    }
}
