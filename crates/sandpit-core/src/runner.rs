//! Running a provisioned sandbox under a wall-clock limit
//!
//! The run (attach, start, drain output, wait) races a timer. The timer is
//! polled first, so once it has fired the run loses even if the program
//! finished in the same instant.

use crate::error::RuntimeError;
use crate::reaper::SandboxLease;
use crate::registry::SandboxRegistry;
use crate::result::{RunOutput, TIMEOUT_EXIT_CODE};
use crate::runtime::{ContainerRuntime, OutputChunk, StreamKind};
use crate::{EngineError, Result, SandboxStatus};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

/// Captures one stream up to a byte cap
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    dropped: usize,
}

impl Captured {
    fn push(&mut self, data: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        let take = room.min(data.len());
        self.bytes.extend_from_slice(&data[..take]);
        self.dropped += data.len() - take;
    }

    fn finish(self) -> String {
        let text = String::from_utf8_lossy(&self.bytes);
        let mut text = text.trim().to_string();
        if self.dropped > 0 {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&format!("[output truncated, {} bytes discarded]", self.dropped));
        }
        text
    }
}

/// Demultiplexed program output
#[derive(Debug)]
pub struct OutputCollector {
    stdout: Captured,
    stderr: Captured,
    limit: usize,
}

impl OutputCollector {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            stdout: Captured::default(),
            stderr: Captured::default(),
            limit,
        }
    }

    pub fn push(&mut self, chunk: &OutputChunk) {
        match chunk.stream {
            StreamKind::Stdout => self.stdout.push(&chunk.data, self.limit),
            StreamKind::Stderr => self.stderr.push(&chunk.data, self.limit),
        }
    }

    /// Trimmed `(stdout, stderr)`.
    #[must_use]
    pub fn finish(self) -> (String, String) {
        (self.stdout.finish(), self.stderr.finish())
    }
}

pub struct Runner {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<SandboxRegistry>,
    max_output_bytes: usize,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("max_output_bytes", &self.max_output_bytes)
            .finish_non_exhaustive()
    }
}

impl Runner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<SandboxRegistry>,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            runtime,
            registry,
            max_output_bytes,
        }
    }

    /// Run the sandbox's program to completion or until `timeout`.
    ///
    /// Non-zero exits and timeouts are ordinary outcomes. Only a runtime
    /// failure underneath the program is an error.
    pub async fn run(
        &self,
        lease: &SandboxLease,
        input: Option<&str>,
        timeout: Duration,
    ) -> Result<RunOutput> {
        let container_id = lease.container_id();
        let stdin = input.map(|s| s.as_bytes().to_vec());
        let mut collector = OutputCollector::new(self.max_output_bytes);

        let outcome = tokio::select! {
            biased;
            () = tokio::time::sleep(timeout) => None,
            finished = self.drive(container_id, stdin, &mut collector) => Some(finished),
        };

        match outcome {
            None => {
                tracing::warn!(
                    sandbox_id = %lease.id(),
                    timeout_ms = %timeout.as_millis(),
                    "execution timed out, killing container"
                );
                if let Err(e) = self.runtime.kill(container_id).await {
                    if !e.is_gone() {
                        tracing::warn!(%container_id, error = %e, "kill after timeout failed");
                    }
                }
                self.registry.set_status(&lease.id(), SandboxStatus::Stopped);

                let (stdout, mut stderr) = collector.finish();
                if !stderr.is_empty() {
                    stderr.push('\n');
                }
                stderr.push_str(&format!("Execution timed out after {}ms", timeout.as_millis()));
                Ok(RunOutput {
                    stdout,
                    stderr,
                    exit_code: TIMEOUT_EXIT_CODE,
                    timed_out: true,
                })
            }
            Some(Ok(status)) => {
                self.registry.set_status(&lease.id(), SandboxStatus::Stopped);
                let (stdout, stderr) = collector.finish();
                let exit_code = i32::try_from(status).unwrap_or(-1);
                tracing::debug!(sandbox_id = %lease.id(), exit_code, "program exited");
                Ok(RunOutput {
                    stdout,
                    stderr,
                    exit_code,
                    timed_out: false,
                })
            }
            Some(Err(source)) => {
                self.registry.set_status(&lease.id(), SandboxStatus::Error);
                Err(EngineError::ExecutionTimeout {
                    message: format!("sandbox {} failed while running: {source}", lease.id()),
                    source,
                })
            }
        }
    }

    async fn drive(
        &self,
        container_id: &str,
        stdin: Option<Vec<u8>>,
        collector: &mut OutputCollector,
    ) -> std::result::Result<i64, RuntimeError> {
        // attach before start so no early output is missed
        let mut output = self.runtime.attach(container_id, stdin).await?;
        self.runtime.start(container_id).await?;
        while let Some(chunk) = output.next().await {
            collector.push(&chunk?);
        }
        self.runtime.wait(container_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::Provisioner;
    use crate::reaper::Reaper;
    use crate::runtime::{MockProgram, MockRuntime};
    use crate::{EngineConfig, ExecutionRequest, Language, ProfileTable};
    use std::time::Instant;

    struct Harness {
        runtime: Arc<MockRuntime>,
        registry: Arc<SandboxRegistry>,
        provisioner: Provisioner,
        runner: Runner,
    }

    fn harness(runtime: MockRuntime, max_output_bytes: usize) -> Harness {
        let runtime = Arc::new(runtime);
        let registry = Arc::new(SandboxRegistry::new());
        let reaper = Arc::new(Reaper::new(
            runtime.clone(),
            Arc::clone(&registry),
            Duration::from_secs(1),
        ));
        Harness {
            provisioner: Provisioner::new(runtime.clone(), reaper, &EngineConfig::default()),
            runner: Runner::new(runtime.clone(), Arc::clone(&registry), max_output_bytes),
            runtime,
            registry,
        }
    }

    async fn lease(h: &Harness) -> SandboxLease {
        let table = ProfileTable::standard();
        let profile = table.get(Language::Python).unwrap();
        h.provisioner
            .provision(profile, &ExecutionRequest::new(Language::Python, "pass"))
            .await
            .unwrap()
    }

    #[test]
    fn collector_caps_each_stream() {
        let mut collector = OutputCollector::new(4);
        collector.push(&OutputChunk::stdout("abcdef"));
        collector.push(&OutputChunk::stderr("xy"));
        let (stdout, stderr) = collector.finish();
        assert_eq!(stdout, "abcd\n[output truncated, 2 bytes discarded]");
        assert_eq!(stderr, "xy");
    }

    #[tokio::test]
    async fn demultiplexes_and_trims() {
        let h = harness(
            MockRuntime::always(
                MockProgram::exits(0)
                    .stdout("  hello\n")
                    .stderr("warn\n")
                    .stdout("world\n\n"),
            ),
            1024,
        );
        let lease = lease(&h).await;

        let run = h.runner.run(&lease, None, Duration::from_secs(5)).await.unwrap();
        assert_eq!(run.stdout, "hello\nworld");
        assert_eq!(run.stderr, "warn");
        assert_eq!(run.exit_code, 0);
        assert!(!run.timed_out);
        assert_eq!(h.registry.get(&lease.id()).unwrap().status, SandboxStatus::Stopped);
        lease.release().await;
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let h = harness(MockRuntime::always(MockProgram::exits(3).stderr("boom")), 1024);
        let lease = lease(&h).await;

        let run = h.runner.run(&lease, None, Duration::from_secs(5)).await.unwrap();
        assert_eq!(run.exit_code, 3);
        assert_eq!(run.stderr, "boom");
        lease.release().await;
    }

    #[tokio::test]
    async fn timeout_kills_and_reports_124() {
        let h = harness(MockRuntime::always(MockProgram::hangs().stdout("partial")), 1024);
        let lease = lease(&h).await;

        let started = Instant::now();
        let run = h.runner.run(&lease, None, Duration::from_millis(50)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        assert!(run.timed_out);
        assert_eq!(run.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(run.stdout, "partial");
        assert_eq!(run.stderr, "Execution timed out after 50ms");
        assert_eq!(h.runtime.kills(), 1);
        lease.release().await;
        assert_eq!(h.runtime.live(), 0);
    }

    #[tokio::test]
    async fn stdin_is_delivered() {
        let h = harness(MockRuntime::always(MockProgram::exits(0)), 1024);
        let lease = lease(&h).await;

        h.runner
            .run(&lease, Some("42\n"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(h.runtime.delivered_stdin(), vec![b"42\n".to_vec()]);
        lease.release().await;
    }

    #[tokio::test]
    async fn runtime_failure_marks_error() {
        let h = harness(
            MockRuntime::always(MockProgram::exits(0).failing_wait("daemon restarted")),
            1024,
        );
        let lease = lease(&h).await;

        let err = h
            .runner
            .run(&lease, None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ExecutionTimeout { .. }));
        assert_eq!(h.registry.get(&lease.id()).unwrap().status, SandboxStatus::Error);
        lease.release().await;
        assert_eq!(h.registry.count(), 0);
    }
}
