//! The execution engine
//!
//! Ties the pipeline together: validate, screen, look up the profile,
//! provision, run under a timeout, and reap. Reaping happens on every path
//! once a sandbox exists; the lease guarantees it even if the caller drops
//! the future mid-run.

use crate::provisioner::Provisioner;
use crate::reaper::Reaper;
use crate::registry::SandboxRegistry;
use crate::runner::Runner;
use crate::runtime::ContainerRuntime;
use crate::screen::SecurityScreen;
use crate::validator;
use crate::{
    EngineConfig, EngineError, ExecutionRequest, ExecutionResult, ProfileTable, Result,
    ValidationResult,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runs untrusted code in disposable containers
pub struct ExecutionEngine {
    config: EngineConfig,
    profiles: ProfileTable,
    screen: SecurityScreen,
    registry: Arc<SandboxRegistry>,
    reaper: Arc<Reaper>,
    provisioner: Provisioner,
    runner: Runner,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("config", &self.config)
            .field("active", &self.registry.count())
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine {
    /// Create an engine with its own empty registry and the standard screen.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: EngineConfig) -> Result<Self> {
        Ok(Self::with_parts(
            runtime,
            config,
            SecurityScreen::standard()?,
            Arc::new(SandboxRegistry::new()),
        ))
    }

    /// Create an engine from explicit parts, e.g. a shared registry.
    pub fn with_parts(
        runtime: Arc<dyn ContainerRuntime>,
        config: EngineConfig,
        screen: SecurityScreen,
        registry: Arc<SandboxRegistry>,
    ) -> Self {
        let reaper = Arc::new(Reaper::new(
            Arc::clone(&runtime),
            Arc::clone(&registry),
            config.stop_grace(),
        ));
        Self {
            profiles: ProfileTable::from_config(&config),
            provisioner: Provisioner::new(Arc::clone(&runtime), Arc::clone(&reaper), &config),
            runner: Runner::new(runtime, Arc::clone(&registry), config.max_output_bytes),
            screen,
            registry,
            reaper,
            config,
        }
    }

    /// Replace the security screen.
    #[must_use]
    pub fn with_screen(mut self, screen: SecurityScreen) -> Self {
        self.screen = screen;
        self
    }

    /// Run `request` in a fresh sandbox.
    ///
    /// The program's own failures (non-zero exit, crash, timeout) come back
    /// as an [`ExecutionResult`]. Errors are reserved for rejected requests
    /// and infrastructure failures.
    pub async fn execute_code(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        validator::ensure_valid(request, &self.profiles, &self.config)?;
        self.screen.screen(&request.code, request.language)?;

        let profile = self.profiles.get(request.language).ok_or_else(|| {
            EngineError::security(format!("unsupported language: {}", request.language))
        })?;
        let timeout = request
            .timeout_ms
            .map_or_else(|| profile.timeout(), Duration::from_millis);

        let lease = self.provisioner.provision(profile, request).await?;
        let sandbox_id = lease.id();

        let started = Instant::now();
        let run = self
            .runner
            .run(&lease, request.input.as_deref(), timeout)
            .await;
        let elapsed = started.elapsed();

        lease.release().await;

        let run = run?;
        let execution_time_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            %sandbox_id,
            language = %request.language,
            exit_code = run.exit_code,
            timed_out = run.timed_out,
            elapsed_ms = execution_time_ms,
            "execution finished"
        );
        Ok(ExecutionResult::from_run(run, execution_time_ms))
    }

    /// Validate without executing.
    #[must_use]
    pub fn validate_request(&self, request: &ExecutionRequest) -> ValidationResult {
        validator::validate(request, &self.profiles, &self.config)
    }

    /// Number of sandboxes currently provisioned and not yet reaped.
    #[must_use]
    pub fn active_sandbox_count(&self) -> usize {
        self.registry.count()
    }

    /// Reap every live sandbox, best effort. Waits for teardowns already in
    /// flight and retries ones that failed earlier. Returns how many were
    /// removed cleanly.
    pub async fn cleanup_all_sandboxes(&self) -> usize {
        let reaped = self.reaper.reap_all().await;
        tracing::info!(
            reaped,
            remaining = self.registry.count(),
            unfinished = self.reaper.unfinished_count(),
            "sandbox cleanup finished"
        );
        reaped
    }

    #[must_use]
    pub const fn profiles(&self) -> &ProfileTable {
        &self.profiles
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Language;
    use crate::runtime::{MockProgram, MockRuntime};

    fn engine(runtime: MockRuntime) -> (Arc<MockRuntime>, ExecutionEngine) {
        let runtime = Arc::new(runtime);
        let engine = ExecutionEngine::new(runtime.clone(), EngineConfig::default()).unwrap();
        (runtime, engine)
    }

    #[tokio::test]
    async fn hello_world() {
        let (runtime, engine) = engine(MockRuntime::always(
            MockProgram::exits(0).stdout("Hello, World!\n"),
        ));
        let request = ExecutionRequest::new(Language::Python, "print('Hello, World!')");

        let result = engine.execute_code(&request).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, "Hello, World!");
        assert_eq!(result.error, None);
        assert_eq!(result.exit_code, 0);
        assert!(!result.timed_out);
        assert_eq!(engine.active_sandbox_count(), 0);
        assert_eq!(runtime.live(), 0);
    }

    #[tokio::test]
    async fn validate_request_reports_without_running() {
        let (runtime, engine) = engine(MockRuntime::always(MockProgram::exits(0)));
        let result = engine.validate_request(&ExecutionRequest::new(Language::Go, ""));
        assert!(!result.is_valid);
        assert_eq!(runtime.created(), 0);
    }

    #[tokio::test]
    async fn disabled_language_is_rejected() {
        let runtime = Arc::new(MockRuntime::always(MockProgram::exits(0)));
        let config = EngineConfig::builder().disable_language(Language::Rust).build();
        let engine = ExecutionEngine::new(runtime.clone(), config).unwrap();

        let err = engine
            .execute_code(&ExecutionRequest::new(Language::Rust, "fn main() {}"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Security { .. }));
        assert_eq!(runtime.created(), 0);
    }

    #[tokio::test]
    async fn request_timeout_overrides_profile() {
        let (_runtime, engine) = engine(MockRuntime::always(MockProgram::hangs()));
        let request = ExecutionRequest::new(Language::JavaScript, "while (true) {}")
            .with_timeout_ms(30);

        let result = engine.execute_code(&request).await.unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, 124);
        assert!(result.execution_time_ms >= 30);
        assert_eq!(engine.active_sandbox_count(), 0);
    }
}
