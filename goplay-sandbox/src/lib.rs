//! Go playground sandbox - bounded execution of untrusted Go submissions
//!
//! A [`SandboxService`] takes a [`Submission`] (source, target, flags) and runs
//! the external toolchain on it inside a throwaway workspace, under a wall-clock
//! deadline, output caps and kernel resource limits. Every outcome comes back
//! as either an [`ExecutionResult`] or a typed [`SandboxError`].

#[cfg(not(unix))]
compile_error!("goplay-sandbox needs process groups and rlimits, which are unix-only");

mod containment;
mod error;
mod execution;
mod governor;
mod output;
mod rlimits;
mod runner;
mod service;
mod toolchain;
mod types;
mod workspace;

pub use containment::Containment;
pub use error::{Result, SandboxError, ValidationError};
pub use execution::{ExecutionId, ExecutionState};
pub use governor::{Busy, ExecutionSlot, ResourceGovernor};
pub use output::{CaptureBuffer, CaptureEnd, OutputBudget, StreamCapture};
pub use rlimits::ProcessLimits;
pub use runner::{CommandSpec, ProcessRunner, Runner};
pub use service::SandboxService;
pub use toolchain::{Toolchain, WASM_ARTIFACT};
pub use types::{ExecutionResult, ExitStatus, Submission, Target};
pub use workspace::{Workspace, WorkspaceManager, SOURCE_FILE, WORKSPACE_PREFIX};

/// Re-export so callers need no direct dependency for limits and cancellation
pub use goplay_common::ResourceLimits;
pub use tokio_util::sync::CancellationToken;
