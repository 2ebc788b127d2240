//! Sandbox provisioning
//!
//! Turns a language profile plus a request into a hardened container, then
//! registers it and hands back a [`SandboxLease`]. The source travels in the
//! container's environment and is materialised by the profile's run script
//! on the scratch tmpfs, so the root filesystem never needs to be writable.

use crate::error::RuntimeError;
use crate::profile::{LanguageProfile, SOURCE_ENV, cpu_quota, parse_memory};
use crate::reaper::{Reaper, SandboxLease};
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::{EngineConfig, EngineError, ExecutionRequest, Result, Sandbox, SandboxId};
use std::collections::HashMap;
use std::sync::Arc;

/// Label marking containers owned by this engine
pub const OWNER_LABEL: &str = "io.sandpit.owner";

/// Label carrying the sandbox id on the container
pub const SANDBOX_LABEL: &str = "io.sandpit.sandbox";

pub struct Provisioner {
    runtime: Arc<dyn ContainerRuntime>,
    reaper: Arc<Reaper>,
    auto_pull: bool,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("auto_pull", &self.auto_pull)
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, reaper: Arc<Reaper>, config: &EngineConfig) -> Self {
        Self {
            runtime,
            reaper,
            auto_pull: config.auto_pull_images,
        }
    }

    /// Create and register a sandbox for `request`.
    ///
    /// Any failure surfaces as [`EngineError::ResourceLimit`] and leaves
    /// nothing registered.
    pub async fn provision(
        &self,
        profile: &LanguageProfile,
        request: &ExecutionRequest,
    ) -> Result<SandboxLease> {
        let id = SandboxId::generate();
        let spec = container_spec(id, profile, request)?;

        let container_id = match self.runtime.create(&spec).await {
            Ok(container_id) => container_id,
            Err(RuntimeError::NotFound(_)) if self.auto_pull => {
                self.runtime
                    .pull_image(&spec.image)
                    .await
                    .map_err(|e| provisioning_failed(&format!("failed to pull {}", spec.image), e))?;
                self.runtime
                    .create(&spec)
                    .await
                    .map_err(|e| provisioning_failed("failed to create container", e))?
            }
            Err(e) => return Err(provisioning_failed("failed to create container", e)),
        };

        let registry = self.reaper.registry();
        if !registry.register(Sandbox::new(id, container_id.clone(), profile.language)) {
            // id collision: the new container has no owner
            if let Err(e) = self.runtime.remove(&container_id).await {
                tracing::error!(%container_id, error = %e, "failed to remove orphaned container");
            }
            return Err(EngineError::resource_limit(format!("duplicate sandbox id {id}")));
        }

        tracing::info!(
            sandbox_id = %id,
            %container_id,
            language = %profile.language,
            image = %spec.image,
            "sandbox provisioned"
        );
        Ok(SandboxLease::new(
            id,
            container_id,
            profile.language,
            Arc::clone(&self.reaper),
        ))
    }
}

fn provisioning_failed(message: &str, source: RuntimeError) -> EngineError {
    EngineError::ResourceLimit {
        message: format!("{message}: {source}"),
        source: Some(source),
    }
}

/// Build the container description for one run.
///
/// Request limits can only tighten the profile's ceilings.
pub fn container_spec(
    id: SandboxId,
    profile: &LanguageProfile,
    request: &ExecutionRequest,
) -> Result<ContainerSpec> {
    let mut memory_bytes = profile.memory_bytes()?;
    if let Some(limit) = &request.memory_limit {
        memory_bytes = memory_bytes.min(parse_memory(limit)?);
    }

    let cpus = request
        .cpu_limit
        .map_or(profile.cpus, |cpus| cpus.min(profile.cpus));
    // validate the requested value even when the profile's is smaller
    if let Some(requested) = request.cpu_limit {
        cpu_quota(requested)?;
    }
    let (quota, period) = cpu_quota(cpus)?;

    let mut env: Vec<String> = profile
        .env
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    env.push(format!("{SOURCE_ENV}={}", request.code));

    let tmpfs = HashMap::from([
        (
            profile.working_dir.clone(),
            format!("rw,exec,nosuid,nodev,size={},mode=1777", profile.scratch_size),
        ),
        ("/tmp".to_string(), "rw,noexec,nosuid,nodev,size=16m,mode=1777".to_string()),
    ]);

    let mut security_opt = Vec::new();
    if !profile.allow_privilege_escalation {
        security_opt.push("no-new-privileges:true".to_string());
    }

    let labels = HashMap::from([
        (OWNER_LABEL.to_string(), "sandpit".to_string()),
        (SANDBOX_LABEL.to_string(), id.to_string()),
        ("io.sandpit.language".to_string(), profile.language.to_string()),
    ]);

    Ok(ContainerSpec {
        name: id.container_name(),
        image: profile.image.clone(),
        command: profile.command(),
        env,
        user: profile.user.clone(),
        working_dir: profile.working_dir.clone(),
        memory_bytes,
        cpu_quota: quota,
        cpu_period: period,
        pids_limit: profile.pids_limit,
        network_mode: profile.network.mode().to_string(),
        read_only_root: profile.read_only_root,
        tmpfs,
        cap_drop: vec!["ALL".to_string()],
        security_opt,
        ulimits: profile.ulimits.clone(),
        open_stdin: request.input.is_some(),
        labels,
    })
}
