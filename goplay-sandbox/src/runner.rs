//! Process runner: one toolchain invocation under a deadline and output caps

use crate::containment::{join_cgroup, Containment, EXECUTION_ENV};
use crate::execution::{ExecutionId, ExecutionState};
use crate::output::{CaptureEnd, OutputBudget};
use crate::rlimits::ProcessLimits;
use crate::types::{ExecutionResult, ExitStatus};
use crate::workspace::Workspace;
use async_trait::async_trait;
use goplay_common::ResourceLimits;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const TRUNCATED: &str = "output truncated: a process kept the pipe open after exit";

/// A fully resolved command line for one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Complete environment of the child; nothing is inherited
    pub env: Vec<(String, String)>,
    /// File the command leaves in the workspace on success
    pub artifact: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            artifact: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn artifact(mut self, name: impl Into<String>) -> Self {
        self.artifact = Some(name.into());
        self
    }

    /// Command line for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Runner abstraction for executing one command inside a workspace
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run `command` in `workspace`. Never fails: every outcome is an `ExecutionResult`.
    async fn run(
        &self,
        workspace: &Workspace,
        command: &CommandSpec,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> ExecutionResult;

    /// Get runner name
    fn name(&self) -> &str;
}

/// Runs the toolchain as a child process in its own process group
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    limits: ProcessLimits,
    containment: Containment,
    stream_cap: usize,
    combined_cap: usize,
    drain_grace: Duration,
}

impl ProcessRunner {
    pub fn new(limits: &ResourceLimits) -> Self {
        Self {
            limits: ProcessLimits::from(limits),
            containment: Containment::detect(None),
            stream_cap: limits.max_stream_output_bytes,
            combined_cap: limits.max_combined_output_bytes,
            drain_grace: Duration::from_secs(1),
        }
    }

    pub fn with_containment(mut self, containment: Containment) -> Self {
        self.containment = containment;
        self
    }

    /// How long to wait for the output pipes to close once every process is dead
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn containment(&self) -> &Containment {
        &self.containment
    }
}

/// Log how a collector ended; true when its output may be incomplete
fn report_capture(id: ExecutionId, stream: &'static str, end: CaptureEnd) -> bool {
    match end {
        CaptureEnd::Complete => false,
        CaptureEnd::Failed(e) => {
            tracing::warn!(execution_id = %id, stream, error = %e, "Failed to read output");
            true
        }
        CaptureEnd::Abandoned => {
            tracing::warn!(execution_id = %id, stream, "Output pipe still open after the process was killed");
            true
        }
    }
}

enum Exit {
    Exited(std::process::ExitStatus),
    WaitFailed(io::Error),
    TimedOut,
    OutputCapped,
    Cancelled,
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn run(
        &self,
        workspace: &Workspace,
        command: &CommandSpec,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let id = workspace.id();
        let started = Instant::now();
        let mut state = ExecutionState::Pending;

        let mut confinement = match self.containment.enter(id) {
            Ok(confinement) => confinement,
            Err(e) => {
                state.advance(ExecutionState::StartFailed);
                tracing::error!(
                    execution_id = %id,
                    containment = self.containment.name(),
                    error = %e,
                    "Failed to prepare process containment"
                );
                return ExecutionResult::internal(
                    id,
                    started.elapsed(),
                    format!("failed to prepare {} containment: {}", self.containment.name(), e),
                );
            }
        };

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(workspace.path())
            .env_clear()
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(EXECUTION_ENV, id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let limits = self.limits;
        let cgroup_procs = confinement.join_path();
        // SAFETY: the closure only issues open/write/close and getrlimit/setrlimit syscalls.
        unsafe {
            cmd.pre_exec(move || {
                if let Some(procs) = &cgroup_procs {
                    join_cgroup(procs)?;
                }
                limits.apply()
            });
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                state.advance(ExecutionState::StartFailed);
                tracing::error!(
                    execution_id = %id,
                    command = %command.display(),
                    error = %e,
                    "Failed to spawn toolchain process"
                );
                confinement.release().await;
                return ExecutionResult::internal(
                    id,
                    started.elapsed(),
                    format!("failed to start {}: {}", command.program.display(), e),
                );
            }
        };
        state.advance(ExecutionState::Running);
        confinement.attach(child.id());

        tracing::debug!(
            execution_id = %id,
            command = %command.display(),
            pid = ?child.id(),
            containment = self.containment.name(),
            deadline_ms = deadline.as_millis() as u64,
            "Toolchain process started"
        );

        let budget = OutputBudget::new(self.stream_cap, self.combined_cap);
        let stdout_capture = budget.spawn_capture(child.stdout.take());
        let stderr_capture = budget.spawn_capture(child.stderr.take());

        let exit = tokio::select! {
            biased;
            _ = cancel.cancelled() => Exit::Cancelled,
            _ = budget.overflow().cancelled() => Exit::OutputCapped,
            _ = tokio::time::sleep(deadline) => Exit::TimedOut,
            status = child.wait() => match status {
                Ok(status) => Exit::Exited(status),
                Err(e) => Exit::WaitFailed(e),
            },
        };

        // Kill even after a normal exit: descendants may outlive the leader
        confinement.kill();
        if !matches!(exit, Exit::Exited(_) | Exit::WaitFailed(_)) {
            if let Err(e) = child.wait().await {
                tracing::warn!(execution_id = %id, error = %e, "Failed to reap killed process");
            }
        }
        let duration = started.elapsed();
        let escaped = confinement.release().await;

        let drain_until = tokio::time::Instant::now() + self.drain_grace;
        let ((stdout, stdout_end), (stderr, stderr_end)) = tokio::join!(
            stdout_capture.finish(drain_until),
            stderr_capture.finish(drain_until)
        );
        let truncated = report_capture(id, "stdout", stdout_end) | report_capture(id, "stderr", stderr_end);

        let (next, exit_code, exited_zero, detail) = match exit {
            // output that overflowed while being drained still counts
            Exit::Exited(status) if budget.overflowed() => {
                (ExecutionState::OutputCapped, status.code(), false, None)
            }
            Exit::Exited(status) => (
                ExecutionState::Completed,
                status.code(),
                status.success(),
                status
                    .signal()
                    .map(|signal| format!("terminated by signal {}", signal)),
            ),
            Exit::WaitFailed(e) => {
                tracing::error!(execution_id = %id, error = %e, "Failed to wait for toolchain process");
                return ExecutionResult::internal(
                    id,
                    duration,
                    format!("failed to wait for {}: {}", command.program.display(), e),
                );
            }
            Exit::TimedOut => (ExecutionState::TimedOut, None, false, None),
            Exit::OutputCapped => (ExecutionState::OutputCapped, None, false, None),
            Exit::Cancelled => (
                ExecutionState::Cancelled,
                None,
                false,
                Some("execution cancelled".to_string()),
            ),
        };
        let detail = match (detail, truncated) {
            (detail, false) => detail,
            (Some(detail), true) => Some(format!("{}; {}", detail, TRUNCATED)),
            (None, true) => Some(TRUNCATED.to_string()),
        };
        state.advance(next);
        let status = state
            .exit_status(exited_zero)
            .unwrap_or(ExitStatus::InternalError);

        tracing::info!(
            execution_id = %id,
            status = %status,
            exit_code = ?exit_code,
            duration_ms = duration.as_millis() as u64,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            escaped,
            "Toolchain process finished"
        );

        ExecutionResult {
            execution_id: id,
            status,
            exit_code,
            stdout,
            stderr,
            duration,
            artifact: None,
            detail,
        }
    }

    fn name(&self) -> &str {
        "process"
    }
}
