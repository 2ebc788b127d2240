//! Language profiles: image, resource ceilings and hardening per language
//!
//! Every profile shares the same hardening baseline (no network, read-only
//! root, no privilege escalation, non-root user, tight ulimits). Profiles are
//! built once at engine construction and never mutated afterwards.

use crate::{EngineConfig, EngineError, Language, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Environment variable carrying the submitted source into the container.
pub const SOURCE_ENV: &str = "SANDPIT_SOURCE";

/// CFS scheduler period used to express CPU shares as a quota.
pub const CPU_PERIOD_US: i64 = 100_000;

/// Network access granted to a sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    /// No network interfaces besides loopback.
    #[default]
    None,
}

impl NetworkPolicy {
    #[must_use]
    pub const fn mode(self) -> &'static str {
        match self {
            Self::None => "none",
        }
    }
}

/// A `{name, soft, hard}` resource ceiling applied to the sandboxed process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ulimit {
    pub name: String,
    pub soft: i64,
    pub hard: i64,
}

impl Ulimit {
    pub fn new(name: impl Into<String>, soft: i64, hard: i64) -> Self {
        Self {
            name: name.into(),
            soft,
            hard,
        }
    }
}

/// Immutable execution profile for one language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub language: Language,

    /// Container image reference
    pub image: String,

    /// Memory ceiling in human-readable form (`128m`, `1g`, ...)
    pub memory: String,

    /// CPU share as a fraction of one core
    pub cpus: f64,

    /// Default wall-clock timeout in milliseconds
    pub timeout_ms: u64,

    pub network: NetworkPolicy,

    pub read_only_root: bool,

    /// Always false; kept explicit so it shows up in dumps of the table
    pub allow_privilege_escalation: bool,

    /// `uid:gid` the program runs as
    pub user: String,

    /// Working directory, backed by a size-limited tmpfs
    pub working_dir: String,

    /// Size of the writable scratch tmpfs at `working_dir`
    pub scratch_size: String,

    /// File name the source is written to inside `working_dir`
    pub source_file: String,

    /// Shell script that materialises the source and runs it
    pub run_script: String,

    pub env: Vec<(String, String)>,

    /// Cgroup pids ceiling for the whole container
    pub pids_limit: i64,

    pub ulimits: Vec<Ulimit>,
}

impl LanguageProfile {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Command handed to the container runtime.
    #[must_use]
    pub fn command(&self) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), self.run_script.clone()]
    }

    /// Memory ceiling in bytes.
    pub fn memory_bytes(&self) -> Result<i64> {
        parse_memory(&self.memory)
    }

    fn base(language: Language, image: &str, source_file: &str, run: &str) -> Self {
        let working_dir = "/sandbox".to_string();
        Self {
            language,
            image: image.into(),
            memory: "128m".into(),
            cpus: 0.5,
            timeout_ms: 30_000,
            network: NetworkPolicy::None,
            read_only_root: true,
            allow_privilege_escalation: false,
            user: "1000:1000".into(),
            scratch_size: "64m".into(),
            source_file: source_file.into(),
            run_script: format!("printf '%s' \"${SOURCE_ENV}\" > {source_file} && {run}"),
            env: vec![
                ("HOME".into(), working_dir.clone()),
                ("TMPDIR".into(), "/tmp".into()),
                ("PATH".into(), "/usr/local/bin:/usr/bin:/bin".into()),
            ],
            working_dir,
            pids_limit: 64,
            ulimits: vec![Ulimit::new("nofile", 64, 64), Ulimit::new("nproc", 64, 64)],
        }
    }

    #[must_use]
    fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    fn with_path(mut self, path: &str) -> Self {
        if let Some(entry) = self.env.iter_mut().find(|(k, _)| k == "PATH") {
            entry.1 = path.into();
        }
        self
    }

    #[must_use]
    fn heavier(mut self, memory: &str, timeout_ms: u64, limit: i64) -> Self {
        self.memory = memory.into();
        self.timeout_ms = timeout_ms;
        self.pids_limit = limit;
        self.ulimits = vec![
            Ulimit::new("nofile", limit, limit),
            Ulimit::new("nproc", limit, limit),
        ];
        self
    }
}

/// Lookup table from language to profile
#[derive(Debug, Clone)]
pub struct ProfileTable {
    profiles: BTreeMap<Language, LanguageProfile>,
}

impl ProfileTable {
    /// The built-in profile for every supported language.
    #[must_use]
    pub fn standard() -> Self {
        let profiles = [
            LanguageProfile::base(
                Language::JavaScript,
                "node:20-alpine",
                "main.js",
                "exec node main.js",
            ),
            LanguageProfile::base(
                Language::TypeScript,
                "denoland/deno:alpine",
                "main.ts",
                "exec deno run --quiet --no-prompt main.ts",
            )
            .with_env("DENO_DIR", "/sandbox/.deno")
            .with_env("NO_COLOR", "1"),
            LanguageProfile::base(
                Language::Python,
                "python:3.12-alpine",
                "main.py",
                "exec python3 -u main.py",
            )
            .with_env("PYTHONDONTWRITEBYTECODE", "1"),
            LanguageProfile::base(
                Language::Java,
                "eclipse-temurin:21-jdk-alpine",
                "Main.java",
                "exec java -XX:+UseSerialGC -XX:TieredStopAtLevel=1 -Djava.io.tmpdir=/sandbox Main.java",
            )
            .with_path("/opt/java/openjdk/bin:/usr/local/bin:/usr/bin:/bin")
            .heavier("256m", 45_000, 128),
            LanguageProfile::base(Language::Go, "golang:1.22-alpine", "main.go", "exec go run main.go")
                .with_path("/usr/local/go/bin:/usr/local/bin:/usr/bin:/bin")
                .with_env("GOCACHE", "/sandbox/.cache")
                .with_env("GOPATH", "/sandbox/go")
                .with_env("CGO_ENABLED", "0")
                .heavier("128m", 30_000, 128),
            LanguageProfile::base(
                Language::Rust,
                "rust:1-slim",
                "main.rs",
                "rustc --edition 2021 -o main main.rs && exec ./main",
            )
            .with_path("/usr/local/cargo/bin:/usr/local/bin:/usr/bin:/bin")
            .heavier("256m", 60_000, 128),
        ];

        Self {
            profiles: profiles.into_iter().map(|p| (p.language, p)).collect(),
        }
    }

    /// The standard table with the config's image overrides and disabled
    /// languages applied.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut table = Self::standard();
        for language in &config.disabled_languages {
            table.profiles.remove(language);
        }
        for (language, image) in &config.image_overrides {
            if let Some(profile) = table.profiles.get_mut(language) {
                profile.image.clone_from(image);
            }
        }
        table
    }

    #[must_use]
    pub fn get(&self, language: Language) -> Option<&LanguageProfile> {
        self.profiles.get(&language)
    }

    #[must_use]
    pub fn supports(&self, language: Language) -> bool {
        self.profiles.contains_key(&language)
    }

    pub fn languages(&self) -> impl Iterator<Item = Language> + '_ {
        self.profiles.keys().copied()
    }
}

impl Default for ProfileTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Convert a human-readable memory size (`512k`, `128m`, `1G`, `64mb`,
/// plain bytes) into bytes.
pub fn parse_memory(spec: &str) -> Result<i64> {
    let invalid = || EngineError::resource_limit(format!("invalid memory limit: {spec:?}"));

    let trimmed = spec.trim().to_ascii_lowercase();
    let unitless = trimmed.strip_suffix('b').unwrap_or(&trimmed);
    let (digits, multiplier) = match unitless.chars().last() {
        Some('k') => (&unitless[..unitless.len() - 1], 1024_i64),
        Some('m') => (&unitless[..unitless.len() - 1], 1024 * 1024),
        Some('g') => (&unitless[..unitless.len() - 1], 1024 * 1024 * 1024),
        Some(c) if c.is_ascii_digit() => (unitless, 1),
        _ => return Err(invalid()),
    };

    let value: i64 = digits.trim().parse().map_err(|_| invalid())?;
    if value <= 0 {
        return Err(invalid());
    }
    value.checked_mul(multiplier).ok_or_else(invalid)
}

/// Translate a CPU share into a `(quota, period)` pair in microseconds.
pub fn cpu_quota(cpus: f64) -> Result<(i64, i64)> {
    if !cpus.is_finite() || cpus <= 0.0 || cpus > 64.0 {
        return Err(EngineError::resource_limit(format!(
            "invalid cpu limit: {cpus}"
        )));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    let quota = (cpus * CPU_PERIOD_US as f64).round() as i64;
    Ok((quota.max(1_000), CPU_PERIOD_US))
}
