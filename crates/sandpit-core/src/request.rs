//! Execution request and validation result types

use crate::Language;
use serde::{Deserialize, Serialize};

/// A request to run one piece of untrusted source code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// Source text
    pub code: String,
    pub language: Language,
    /// Data fed to the program's stdin
    #[serde(default)]
    pub input: Option<String>,
    /// Wall-clock limit; the profile default applies when absent
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Memory ceiling such as `64m`; may only tighten the profile's
    #[serde(default)]
    pub memory_limit: Option<String>,
    /// CPU share; may only tighten the profile's
    #[serde(default)]
    pub cpu_limit: Option<f64>,
}

impl ExecutionRequest {
    pub fn new(language: Language, code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language,
            input: None,
            timeout_ms: None,
            memory_limit: None,
            cpu_limit: None,
        }
    }

    #[must_use]
    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    #[must_use]
    pub const fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub fn with_memory_limit(mut self, limit: impl Into<String>) -> Self {
        self.memory_limit = Some(limit.into());
        self
    }

    #[must_use]
    pub const fn with_cpu_limit(mut self, cpus: f64) -> Self {
        self.cpu_limit = Some(cpus);
        self
    }
}

/// Outcome of validating a request. Built fresh per request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub(crate) fn from_findings(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_camel_case_with_optional_fields() {
        let req: ExecutionRequest = serde_json::from_str(
            r#"{"code": "print(1)", "language": "python", "timeoutMs": 5000}"#,
        )
        .unwrap();
        assert_eq!(req.language, Language::Python);
        assert_eq!(req.timeout_ms, Some(5000));
        assert!(req.input.is_none());
        assert!(req.memory_limit.is_none());
    }
}
