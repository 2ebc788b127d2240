//! Request validation, run before anything is allocated

use crate::{EngineConfig, EngineError, ExecutionRequest, ProfileTable, Result, ValidationResult};

/// Caller timeouts outside this range (milliseconds) draw a warning.
pub const TIMEOUT_WARN_RANGE_MS: std::ops::RangeInclusive<u64> = 1_000..=120_000;

/// Check a request against size limits and the supported language set.
///
/// Every violation is collected; nothing short-circuits.
#[must_use]
pub fn validate(
    request: &ExecutionRequest,
    profiles: &ProfileTable,
    config: &EngineConfig,
) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if request.code.trim().is_empty() {
        errors.push("code must not be empty".to_string());
    } else if request.code.len() > config.max_code_bytes {
        errors.push(format!(
            "code is {} bytes, limit is {}",
            request.code.len(),
            config.max_code_bytes
        ));
    }

    if !profiles.supports(request.language) {
        errors.push(format!("unsupported language: {}", request.language));
    }

    if let Some(input) = &request.input {
        if input.len() > config.max_input_bytes {
            errors.push(format!(
                "input is {} bytes, limit is {}",
                input.len(),
                config.max_input_bytes
            ));
        }
    }

    if let Some(timeout_ms) = request.timeout_ms {
        if !TIMEOUT_WARN_RANGE_MS.contains(&timeout_ms) {
            warnings.push(format!(
                "timeout of {timeout_ms}ms is outside the recommended 1-120s range"
            ));
        }
    }

    ValidationResult::from_findings(errors, warnings)
}

/// Validate and turn a failed result into a [`EngineError::Security`].
pub fn ensure_valid(
    request: &ExecutionRequest,
    profiles: &ProfileTable,
    config: &EngineConfig,
) -> Result<ValidationResult> {
    let result = validate(request, profiles, config);
    for warning in &result.warnings {
        tracing::warn!(language = %request.language, "{warning}");
    }
    if result.is_valid {
        Ok(result)
    } else {
        Err(EngineError::Security {
            violations: result.errors,
        })
    }
}
