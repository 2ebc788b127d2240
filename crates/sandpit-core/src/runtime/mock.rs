//! Scripted in-memory container runtime
//!
//! Each created container gets a [`MockProgram`] chosen by a behaviour
//! closure that sees the full [`ContainerSpec`] (including the submitted
//! source in its environment). Counters expose what happened so tests can
//! assert on leaks and kills.

use super::{ContainerRuntime, ContainerSpec, OutputChunk, OutputStream};
use crate::error::RuntimeError;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Exit status reported for a container killed by SIGKILL
pub const KILLED_EXIT_CODE: i64 = 137;

/// Scripted behaviour of one mock container
#[derive(Debug, Clone, Default)]
pub struct MockProgram {
    pub output: Vec<OutputChunk>,
    pub exit_code: i64,
    /// How long the program runs once started; `None` never exits by itself
    pub run_for: Option<Duration>,
    pub attach_error: Option<String>,
    pub start_error: Option<String>,
    pub wait_error: Option<String>,
}

impl MockProgram {
    /// A program that exits immediately with `code`.
    #[must_use]
    pub fn exits(code: i64) -> Self {
        Self {
            exit_code: code,
            run_for: Some(Duration::ZERO),
            ..Self::default()
        }
    }

    /// A program that never terminates on its own.
    #[must_use]
    pub fn hangs() -> Self {
        Self {
            run_for: None,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn stdout(mut self, text: &str) -> Self {
        self.output.push(OutputChunk::stdout(text));
        self
    }

    #[must_use]
    pub fn stderr(mut self, text: &str) -> Self {
        self.output.push(OutputChunk::stderr(text));
        self
    }

    #[must_use]
    pub const fn running_for(mut self, duration: Duration) -> Self {
        self.run_for = Some(duration);
        self
    }

    #[must_use]
    pub fn failing_attach(mut self, message: &str) -> Self {
        self.attach_error = Some(message.into());
        self
    }

    #[must_use]
    pub fn failing_start(mut self, message: &str) -> Self {
        self.start_error = Some(message.into());
        self
    }

    #[must_use]
    pub fn failing_wait(mut self, message: &str) -> Self {
        self.wait_error = Some(message.into());
        self
    }
}

type Behavior = dyn Fn(&ContainerSpec) -> MockProgram + Send + Sync;

struct MockContainer {
    program: MockProgram,
    exit: Arc<watch::Sender<Option<i64>>>,
    started: bool,
}

impl MockContainer {
    fn exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    fn finish(&self, code: i64) {
        finish(&self.exit, code);
    }
}

fn finish(exit: &watch::Sender<Option<i64>>, code: i64) {
    exit.send_if_modified(|status| {
        if status.is_none() {
            *status = Some(code);
            true
        } else {
            false
        }
    });
}

async fn exit_status(mut rx: watch::Receiver<Option<i64>>) -> Option<i64> {
    rx.wait_for(Option::is_some).await.ok().and_then(|status| *status)
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    containers: HashMap<String, MockContainer>,
    specs: Vec<ContainerSpec>,
    stdin: Vec<Vec<u8>>,
    created: usize,
    removed: usize,
    kills: usize,
    pulls: Vec<String>,
    create_error: Option<String>,
    remove_error: Option<String>,
    stop_delay: Option<Duration>,
    missing_images: HashSet<String>,
}

pub struct MockRuntime {
    behavior: Box<Behavior>,
    state: Mutex<MockState>,
}

impl std::fmt::Debug for MockRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockRuntime")
            .field("created", &state.created)
            .field("removed", &state.removed)
            .field("live", &state.containers.len())
            .finish_non_exhaustive()
    }
}

impl MockRuntime {
    pub fn new(behavior: impl Fn(&ContainerSpec) -> MockProgram + Send + Sync + 'static) -> Self {
        Self {
            behavior: Box::new(behavior),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Every container runs the same program.
    #[must_use]
    pub fn always(program: MockProgram) -> Self {
        Self::new(move |_| program.clone())
    }

    /// Make every `create` fail as if the runtime were down.
    #[must_use]
    pub fn with_create_failure(self, message: &str) -> Self {
        self.state.lock().create_error = Some(message.into());
        self
    }

    /// Make every `remove` fail with a server error.
    #[must_use]
    pub fn with_remove_failure(self, message: &str) -> Self {
        self.state.lock().remove_error = Some(message.into());
        self
    }

    /// Let the failure set by [`Self::with_remove_failure`] clear up.
    pub fn clear_remove_failure(&self) {
        self.state.lock().remove_error = None;
    }

    /// Make every `stop` take `delay` before it does anything.
    #[must_use]
    pub fn with_stop_delay(self, delay: Duration) -> Self {
        self.state.lock().stop_delay = Some(delay);
        self
    }

    /// Treat `image` as absent until it is pulled.
    #[must_use]
    pub fn with_missing_image(self, image: &str) -> Self {
        self.state.lock().missing_images.insert(image.into());
        self
    }

    #[must_use]
    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    #[must_use]
    pub fn removed(&self) -> usize {
        self.state.lock().removed
    }

    /// Containers created and not yet removed.
    #[must_use]
    pub fn live(&self) -> usize {
        self.state.lock().containers.len()
    }

    #[must_use]
    pub fn kills(&self) -> usize {
        self.state.lock().kills
    }

    #[must_use]
    pub fn pulls(&self) -> Vec<String> {
        self.state.lock().pulls.clone()
    }

    #[must_use]
    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.state.lock().specs.clone()
    }

    /// Stdin payloads delivered through `attach`, in order.
    #[must_use]
    pub fn delivered_stdin(&self) -> Vec<Vec<u8>> {
        self.state.lock().stdin.clone()
    }

    fn not_found(container_id: &str) -> RuntimeError {
        RuntimeError::NotFound(format!("No such container: {container_id}"))
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let program = (self.behavior)(spec);
        let mut state = self.state.lock();
        if let Some(message) = &state.create_error {
            return Err(RuntimeError::Unavailable(message.clone()));
        }
        if state.missing_images.contains(&spec.image) {
            return Err(RuntimeError::NotFound(format!("No such image: {}", spec.image)));
        }

        state.next_id += 1;
        let id = format!("mock-{:04}", state.next_id);
        let (exit, _) = watch::channel(None);
        state.containers.insert(
            id.clone(),
            MockContainer {
                program,
                exit: Arc::new(exit),
                started: false,
            },
        );
        state.specs.push(spec.clone());
        state.created += 1;
        Ok(id)
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state.missing_images.remove(image);
        state.pulls.push(image.into());
        Ok(())
    }

    async fn attach(
        &self,
        container_id: &str,
        stdin: Option<Vec<u8>>,
    ) -> Result<OutputStream, RuntimeError> {
        let mut state = self.state.lock();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| Self::not_found(container_id))?;
        if let Some(message) = &container.program.attach_error {
            return Err(RuntimeError::Other(message.clone()));
        }

        let chunks = container.program.output.clone();
        let exited = exit_status(container.exit.subscribe());
        if let Some(bytes) = stdin {
            state.stdin.push(bytes);
        }

        // output first, then the stream stays open until the container exits
        let tail = futures::stream::once(exited).filter_map(|_| async { None });
        Ok(futures::stream::iter(chunks.into_iter().map(Ok))
            .chain(tail)
            .boxed())
    }

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| Self::not_found(container_id))?;
        if let Some(message) = &container.program.start_error {
            return Err(RuntimeError::Api {
                status: 500,
                message: message.clone(),
            });
        }
        container.started = true;

        if let Some(run_for) = container.program.run_for {
            let exit = Arc::clone(&container.exit);
            let code = container.program.exit_code;
            tokio::spawn(async move {
                tokio::time::sleep(run_for).await;
                finish(&exit, code);
            });
        }
        Ok(())
    }

    async fn wait(&self, container_id: &str) -> Result<i64, RuntimeError> {
        let rx = {
            let state = self.state.lock();
            let container = state
                .containers
                .get(container_id)
                .ok_or_else(|| Self::not_found(container_id))?;
            if let Some(message) = &container.program.wait_error {
                return Err(RuntimeError::Unavailable(message.clone()));
            }
            container.exit.subscribe()
        };
        exit_status(rx)
            .await
            .ok_or_else(|| Self::not_found(container_id))
    }

    async fn kill(&self, container_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| Self::not_found(container_id))?;
        if !container.started || container.exited() {
            return Err(RuntimeError::NotModified(format!(
                "Container {container_id} is not running"
            )));
        }
        container.finish(KILLED_EXIT_CODE);
        state.kills += 1;
        Ok(())
    }

    async fn stop(&self, container_id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        let delay = self.state.lock().stop_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| Self::not_found(container_id))?;
        if !container.started || container.exited() {
            return Err(RuntimeError::NotModified(container_id.to_string()));
        }
        container.finish(KILLED_EXIT_CODE);
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        if let Some(message) = &state.remove_error {
            return Err(RuntimeError::Api {
                status: 500,
                message: message.clone(),
            });
        }
        let container = state
            .containers
            .remove(container_id)
            .ok_or_else(|| Self::not_found(container_id))?;
        container.finish(KILLED_EXIT_CODE);
        state.removed += 1;
        Ok(())
    }
}
