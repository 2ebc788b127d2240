//! # sandpit-core
//!
//! Sandboxed execution of untrusted, multi-language source code.
//!
//! A submission flows through:
//! - request validation (size limits, supported language)
//! - a static security screen (per-language and shell pattern tables)
//! - provisioning of a hardened, disposable container
//! - a run raced against a wall-clock timeout
//! - unconditional reaping of the container
//!
//! The container runtime sits behind [`runtime::ContainerRuntime`], with a
//! Docker backend for production and a scripted mock for tests.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod language;
pub mod profile;
pub mod protocol;
pub mod provisioner;
pub mod reaper;
pub mod registry;
pub mod request;
pub mod result;
pub mod runner;
pub mod runtime;
pub mod sandbox;
pub mod screen;
pub mod validator;

pub use config::EngineConfig;
pub use engine::ExecutionEngine;
pub use error::{EngineError, ErrorKind, RuntimeError};
pub use language::{Language, UnsupportedLanguage};
pub use profile::{LanguageProfile, ProfileTable};
pub use registry::SandboxRegistry;
pub use request::{ExecutionRequest, ValidationResult};
pub use result::ExecutionResult;
pub use sandbox::{Sandbox, SandboxId, SandboxStatus};
pub use screen::SecurityScreen;

/// Crate-level result type
pub type Result<T> = std::result::Result<T, EngineError>;
