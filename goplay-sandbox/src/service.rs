//! Sandbox service - main entry point

use crate::containment::Containment;
use crate::error::{Result, SandboxError};
use crate::execution::ExecutionId;
use crate::governor::{Busy, ResourceGovernor};
use crate::runner::{ProcessRunner, Runner};
use crate::toolchain::Toolchain;
use crate::types::{ExecutionResult, ExitStatus, Submission};
use crate::workspace::WorkspaceManager;
use goplay_common::{AppConfig, SandboxConfig, ToolchainConfig};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Extra age, on top of the longest deadline, before a leftover workspace counts as stale
const STALE_GRACE: Duration = Duration::from_secs(60);

/// Executes submissions: validate, admit, prepare a workspace, run, clean up
pub struct SandboxService {
    runner: Arc<dyn Runner>,
    governor: ResourceGovernor,
    workspaces: WorkspaceManager,
    toolchain: Toolchain,
}

impl SandboxService {
    /// Create a service that runs the real toolchain as child processes
    pub fn new(sandbox: &SandboxConfig, toolchain: ToolchainConfig) -> Self {
        let mut runner = ProcessRunner::new(&sandbox.limits);
        if let Some(parent) = &sandbox.cgroup_parent {
            runner = runner.with_containment(Containment::detect(Some(parent)));
        }
        tracing::debug!(containment = runner.containment().name(), "Process runner ready");
        Self::with_runner(sandbox, toolchain, Arc::new(runner))
    }

    /// Create a service with a custom runner implementation
    pub fn with_runner(
        sandbox: &SandboxConfig,
        toolchain: ToolchainConfig,
        runner: Arc<dyn Runner>,
    ) -> Self {
        Self {
            runner,
            governor: ResourceGovernor::from_config(sandbox),
            workspaces: WorkspaceManager::new(&sandbox.workspace_root),
            toolchain: Toolchain::new(toolchain),
        }
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        Self::new(&config.sandbox, config.toolchain.clone())
    }

    /// Execute a submission to completion
    pub async fn execute(&self, submission: Submission) -> Result<ExecutionResult> {
        self.execute_with_cancel(submission, CancellationToken::new())
            .await
    }

    /// Execute a submission; cancelling `cancel` kills the running process
    pub async fn execute_with_cancel(
        &self,
        submission: Submission,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let target = submission.target();

        // Nothing is allocated for a submission that fails validation
        self.governor.check_submission(&submission)?;
        self.toolchain.validate_flags(&submission)?;

        let mut slot = self
            .governor
            .acquire_slot()
            .await
            .map_err(|Busy { capacity }| {
                tracing::warn!(target_kind = %target, capacity, "Rejecting submission, all slots busy");
                SandboxError::Capacity { capacity }
            })?;

        let id = ExecutionId::new();
        tracing::info!(
            execution_id = %id,
            target_kind = %target,
            runner = self.runner.name(),
            source_len = submission.len(),
            "Executing submission"
        );

        let workspace = self.workspaces.acquire(id, &submission).await?;
        let command = self.toolchain.command_for(&submission, &workspace)?;
        let deadline = self.governor.deadline_for(target);
        let limits = self.governor.limits();

        let mut result = self
            .runner
            .run(&workspace, &command, deadline, cancel)
            .await;
        let mut output_limit = stream_limit(&result, limits.max_stream_output_bytes)
            .unwrap_or(limits.max_combined_output_bytes);

        if result.status == ExitStatus::Ok {
            if let Some(name) = &command.artifact {
                match workspace.read_artifact(name, limits.max_artifact_bytes).await {
                    Ok(bytes) => result.artifact = Some(bytes),
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                        result.status = ExitStatus::OutputTooLarge;
                        result.detail = Some(e.to_string());
                        output_limit = limits.max_artifact_bytes as usize;
                    }
                    Err(e) => {
                        result.status = ExitStatus::InternalError;
                        result.detail = Some(format!("failed to read artifact {}: {}", name, e));
                    }
                }
            }
        }

        if let Err(e) = workspace.release().await {
            tracing::warn!(execution_id = %id, error = %e, "Failed to remove workspace");
        }
        slot.release();

        tracing::info!(
            execution_id = %id,
            target_kind = %target,
            status = %result.status,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms(),
            "Execution finished"
        );

        classify(result, deadline, output_limit)
    }

    pub fn governor(&self) -> &ResourceGovernor {
        &self.governor
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Get the runner name
    pub fn runner_name(&self) -> &str {
        self.runner.name()
    }

    /// Remove workspaces left behind by a previous process
    pub fn sweep_stale_workspaces(&self) -> io::Result<usize> {
        self.workspaces
            .sweep_stale(self.governor.longest_deadline() + STALE_GRACE)
    }
}

/// The per-stream cap, if a stream was cut off at it
fn stream_limit(result: &ExecutionResult, per_stream: usize) -> Option<usize> {
    let hit = result.stdout.len() >= per_stream || result.stderr.len() >= per_stream;
    hit.then_some(per_stream)
}

fn classify(
    result: ExecutionResult,
    deadline: Duration,
    output_limit: usize,
) -> Result<ExecutionResult> {
    match result.status {
        ExitStatus::Ok => Ok(result),
        ExitStatus::NonzeroExit => Err(SandboxError::UntrustedProgram(Box::new(result))),
        ExitStatus::Timeout => Err(SandboxError::Timeout {
            result: Box::new(result),
            deadline,
        }),
        ExitStatus::OutputTooLarge => Err(SandboxError::OutputLimit {
            result: Box::new(result),
            limit: output_limit,
        }),
        ExitStatus::InternalError => {
            let detail = result
                .detail
                .unwrap_or_else(|| "execution failed".to_string());
            tracing::error!(
                execution_id = %result.execution_id,
                detail = %detail,
                "Execution failed inside the service"
            );
            Err(SandboxError::Internal(detail))
        }
    }
}
