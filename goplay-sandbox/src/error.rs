//! Error taxonomy for sandboxed execution
//!
//! Every failure of the untrusted program is converted into one of these
//! variants before it reaches the caller; none of them is a service fault
//! except [`SandboxError::Internal`].

use crate::types::{ExecutionResult, Target};
use std::time::Duration;
use thiserror::Error;

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Why a submission was rejected before any resource was touched
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("source is {size} bytes, the limit is {max} bytes")]
    SourceTooLarge { size: usize, max: usize },

    #[error("source is empty")]
    EmptySource,

    #[error("unknown target '{0}' (expected run, compile-wasm or format)")]
    UnknownTarget(String),

    #[error("flag '{flag}' is not allowed for target {target}")]
    FlagNotAllowed { flag: String, target: Target },

    #[error("conflicting flags: {0}")]
    ConflictingFlags(String),
}

/// Typed outcome of a failed execution
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Oversized or malformed submission
    #[error("invalid submission: {0}")]
    Validation(#[from] ValidationError),

    /// Every slot is taken; the caller should retry later
    #[error("all {capacity} execution slots are busy, try again later")]
    Capacity { capacity: usize },

    /// The submitted code failed to build or exited non-zero
    #[error("program failed{}", exit_code_suffix(.0))]
    UntrustedProgram(Box<ExecutionResult>),

    /// The submission ran past its deadline and was killed
    #[error("program exceeded the {}s time limit and was terminated", .deadline.as_secs_f64())]
    Timeout {
        result: Box<ExecutionResult>,
        deadline: Duration,
    },

    /// The submission produced more output than allowed and was killed
    #[error("program output exceeded the {limit} byte limit and was terminated")]
    OutputLimit {
        result: Box<ExecutionResult>,
        limit: usize,
    },

    /// The service itself failed (missing toolchain, filesystem, spawn failure)
    #[error("internal error: {0}")]
    Internal(String),
}

fn exit_code_suffix(result: &ExecutionResult) -> String {
    match result.exit_code {
        Some(code) => format!(" with exit code {}", code),
        None => String::new(),
    }
}

impl SandboxError {
    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Validation(_) => "validation",
            SandboxError::Capacity { .. } => "capacity",
            SandboxError::UntrustedProgram(_) => "nonzero-exit",
            SandboxError::Timeout { .. } => "timeout",
            SandboxError::OutputLimit { .. } => "output-too-large",
            SandboxError::Internal(_) => "internal-error",
        }
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            SandboxError::Validation(ValidationError::SourceTooLarge { .. }) => 413,
            SandboxError::Validation(_) => 400,
            SandboxError::Capacity { .. } => 503,
            SandboxError::UntrustedProgram(_) => 400,
            // never 408: a timed out request must not be resent
            SandboxError::Timeout { .. } | SandboxError::OutputLimit { .. } => 422,
            SandboxError::Internal(_) => 500,
        }
    }

    /// Message safe to show to the submitter. Internal details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            SandboxError::Internal(_) => {
                "internal server error, the submission could not be processed".to_string()
            }
            SandboxError::UntrustedProgram(result) => result.diagnostics(),
            other => other.to_string(),
        }
    }

    /// The execution result, for errors that happened after the program ran
    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            SandboxError::UntrustedProgram(result)
            | SandboxError::Timeout { result, .. }
            | SandboxError::OutputLimit { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Check if retrying the same submission later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SandboxError::Capacity { .. })
    }
}
