//! Execution result types

use serde::{Deserialize, Serialize};

/// Exit code reported when the engine killed a program for running too long
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Raw outcome of one sandboxed run, before it is shaped for the caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    /// Trimmed standard output
    pub stdout: String,
    /// Trimmed standard error
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Result of a sandboxed code execution, returned to the caller as-is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// True when the program exited with status 0
    pub success: bool,

    /// Standard output
    pub output: String,

    /// Standard error, absent when the program wrote nothing to it
    pub error: Option<String>,

    /// Wall-clock time spent running the program
    pub execution_time_ms: u64,

    /// Exit code of the process, or 124 on timeout
    pub exit_code: i32,

    /// Whether the process was killed due to timeout
    pub timed_out: bool,
}

impl ExecutionResult {
    #[must_use]
    pub fn from_run(run: RunOutput, execution_time_ms: u64) -> Self {
        Self {
            success: run.exit_code == 0,
            output: run.stdout,
            error: (!run.stderr.is_empty()).then_some(run.stderr),
            execution_time_ms,
            exit_code: run.exit_code,
            timed_out: run.timed_out,
        }
    }
}
