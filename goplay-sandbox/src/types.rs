//! Core types for sandbox execution

use crate::error::ValidationError;
use crate::execution::ExecutionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What the toolchain should do with a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Target {
    /// `go run`: compile and execute, capture output
    Run,
    /// `tinygo build`: produce a WebAssembly artifact
    CompileWasm,
    /// `gofmt`: reformat the source
    Format,
}

impl Target {
    pub fn as_str(self) -> &'static str {
        match self {
            Target::Run => "run",
            Target::CompileWasm => "compile-wasm",
            Target::Format => "format",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(Target::Run),
            "compile-wasm" => Ok(Target::CompileWasm),
            "format" => Ok(Target::Format),
            other => Err(ValidationError::UnknownTarget(other.to_string())),
        }
    }
}

/// One untrusted-code request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    source: String,
    target: Target,
    flags: Vec<String>,
}

impl Submission {
    pub fn new(source: impl Into<String>, target: Target) -> Self {
        Self {
            source: source.into(),
            target,
            flags: Vec::new(),
        }
    }

    /// Attach toolchain flags; they are checked against the allow-list at execution time
    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags = flags.into_iter().map(Into::into).collect();
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn flags(&self) -> &[String] {
        &self.flags
    }

    /// Source length in bytes
    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.trim().is_empty()
    }
}

/// How an execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitStatus {
    Ok,
    NonzeroExit,
    Timeout,
    OutputTooLarge,
    InternalError,
}

impl ExitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitStatus::Ok => "ok",
            ExitStatus::NonzeroExit => "nonzero-exit",
            ExitStatus::Timeout => "timeout",
            ExitStatus::OutputTooLarge => "output-too-large",
            ExitStatus::InternalError => "internal-error",
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one toolchain invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,

    pub status: ExitStatus,

    /// Process exit code, when the process exited on its own
    pub exit_code: Option<i32>,

    /// Captured stdout, never longer than the stream cap
    pub stdout: Vec<u8>,

    /// Captured stderr, never longer than the stream cap
    pub stderr: Vec<u8>,

    /// Wall-clock time from spawn to reap
    pub duration: Duration,

    /// Build artifact (`compile-wasm` only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Vec<u8>>,

    /// Service-side detail for internal errors and signals; not for end users
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ExecutionResult {
    pub(crate) fn internal(
        execution_id: ExecutionId,
        duration: Duration,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            execution_id,
            status: ExitStatus::InternalError,
            exit_code: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            duration,
            artifact: None,
            detail: Some(detail.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.status == ExitStatus::Ok
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }

    /// Diagnostic text for a failed build or run: stderr, falling back to stdout
    pub fn diagnostics(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout_lossy()
        } else {
            self.stderr_lossy()
        }
    }
}
