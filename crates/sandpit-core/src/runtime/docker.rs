//! Docker Engine backend

use super::{ContainerRuntime, ContainerSpec, OutputChunk, OutputStream};
use crate::error::RuntimeError;
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, ResourcesUlimits};
use futures::{StreamExt, TryStreamExt};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Runs sandboxes as Docker containers through the Engine API
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the local socket.
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    #[must_use]
    pub const fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Check the daemon answers.
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }

    fn container_config(spec: &ContainerSpec) -> Config<String> {
        let ulimits = spec
            .ulimits
            .iter()
            .map(|u| ResourcesUlimits {
                name: Some(u.name.clone()),
                soft: Some(u.soft),
                hard: Some(u.hard),
            })
            .collect();

        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            // equal to memory: no swap on top
            memory_swap: Some(spec.memory_bytes),
            cpu_quota: Some(spec.cpu_quota),
            cpu_period: Some(spec.cpu_period),
            pids_limit: Some(spec.pids_limit),
            network_mode: Some(spec.network_mode.clone()),
            readonly_rootfs: Some(spec.read_only_root),
            tmpfs: Some(spec.tmpfs.clone()),
            cap_drop: Some(spec.cap_drop.clone()),
            security_opt: Some(spec.security_opt.clone()),
            ulimits: Some(ulimits),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(spec.env.clone()),
            user: Some(spec.user.clone()),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(spec.labels.clone()),
            network_disabled: Some(spec.network_mode == "none"),
            attach_stdin: Some(spec.open_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(spec.open_stdin),
            stdin_once: Some(spec.open_stdin),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let response = self
            .docker
            .create_container(Some(options), Self::container_config(spec))
            .await?;
        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, "docker: {warning}");
        }
        Ok(response.id)
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        tracing::info!(image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_for_each(|_| async { Ok(()) })
            .await?;
        Ok(())
    }

    async fn attach(
        &self,
        container_id: &str,
        stdin: Option<Vec<u8>>,
    ) -> Result<OutputStream, RuntimeError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(stdin.is_some()),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            detach_keys: None,
        };
        let AttachContainerResults { output, mut input } = self
            .docker
            .attach_container(container_id, Some(options))
            .await?;

        if let Some(bytes) = stdin {
            let id = container_id.to_string();
            tokio::spawn(async move {
                let delivery = async {
                    input.write_all(&bytes).await?;
                    input.shutdown().await
                };
                if let Err(e) = delivery.await {
                    tracing::debug!(container_id = %id, error = %e, "stdin delivery failed");
                }
            });
        }

        let stream = output.filter_map(|item| async move {
            match item {
                Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                    Some(Ok(OutputChunk::stdout(message.to_vec())))
                }
                Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::stderr(message.to_vec()))),
                Ok(LogOutput::StdIn { .. }) => None,
                Err(e) => Some(Err(RuntimeError::from(e))),
            }
        });
        Ok(stream.boxed())
    }

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn wait(&self, container_id: &str) -> Result<i64, RuntimeError> {
        let mut statuses = Box::pin(
            self.docker
                .wait_container(container_id, None::<WaitContainerOptions<String>>),
        );
        match statuses.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(RuntimeError::Other(format!(
                "wait for {container_id} ended without an exit status"
            ))),
        }
    }

    async fn kill(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(container_id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await?;
        Ok(())
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let t = i64::try_from(grace.as_secs()).unwrap_or(i64::MAX);
        self.docker
            .stop_container(container_id, Some(StopContainerOptions { t }))
            .await?;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await?;
        Ok(())
    }
}

impl From<DockerError> for RuntimeError {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::NotFound(message),
            DockerError::DockerResponseServerError {
                status_code: 304,
                message,
            } => Self::NotModified(message),
            DockerError::DockerResponseServerError {
                status_code: 409,
                message,
            } if message.contains("is not running") || message.contains("already in progress") => {
                Self::NotModified(message)
            }
            DockerError::DockerResponseServerError {
                status_code,
                message,
            } => Self::Api {
                status: status_code,
                message,
            },
            DockerError::IOError { err } => Self::Io(err),
            DockerError::SocketNotFoundError(path) => Self::Unavailable(path),
            other => Self::Other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Ulimit;
    use std::collections::HashMap;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "sandpit-test".into(),
            image: "python:3.12-alpine".into(),
            command: vec!["/bin/sh".into(), "-c".into(), "true".into()],
            env: vec!["HOME=/sandbox".into()],
            user: "1000:1000".into(),
            working_dir: "/sandbox".into(),
            memory_bytes: 128 * 1024 * 1024,
            cpu_quota: 50_000,
            cpu_period: 100_000,
            pids_limit: 64,
            network_mode: "none".into(),
            read_only_root: true,
            tmpfs: HashMap::from([("/sandbox".into(), "rw,size=64m".into())]),
            cap_drop: vec!["ALL".into()],
            security_opt: vec!["no-new-privileges:true".into()],
            ulimits: vec![Ulimit::new("nofile", 64, 64)],
            open_stdin: true,
            labels: HashMap::new(),
        }
    }

    #[test]
    fn container_config_carries_hardening() {
        let config = DockerRuntime::container_config(&spec());
        let host = config.host_config.unwrap();

        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(config.user.as_deref(), Some("1000:1000"));
        assert_eq!(config.stdin_once, Some(true));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.memory, host.memory_swap);
        assert_eq!(host.cpu_quota, Some(50_000));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        let ulimits = host.ulimits.unwrap();
        assert_eq!(ulimits[0].name.as_deref(), Some("nofile"));
        assert_eq!(ulimits[0].hard, Some(64));
    }

    #[test]
    fn maps_gone_responses() {
        let not_found: RuntimeError = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: abc".into(),
        }
        .into();
        assert!(not_found.is_gone());

        let not_running: RuntimeError = DockerError::DockerResponseServerError {
            status_code: 409,
            message: "Container abc is not running".into(),
        }
        .into();
        assert!(not_running.is_gone());

        let conflict: RuntimeError = DockerError::DockerResponseServerError {
            status_code: 409,
            message: "name already in use".into(),
        }
        .into();
        assert!(matches!(conflict, RuntimeError::Api { status: 409, .. }));
    }
}
