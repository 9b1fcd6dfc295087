//! Execution identity and the runner's lifecycle state machine

use crate::types::ExitStatus;
use serde::{Deserialize, Serialize};

/// Unique execution identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub uuid::Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of one toolchain invocation
///
/// `Pending -> Running -> {Completed, TimedOut, OutputCapped, Cancelled}`, or
/// `Pending -> StartFailed`. Terminal states are sticky: the first one wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Pending,
    Running,
    Completed,
    TimedOut,
    OutputCapped,
    StartFailed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionState::Pending | ExecutionState::Running)
    }

    /// Move to `next` if the transition is legal. Returns whether the state changed.
    pub fn advance(&mut self, next: ExecutionState) -> bool {
        use ExecutionState::*;

        let legal = match (*self, next) {
            (Pending, Running) | (Pending, StartFailed) => true,
            (Running, Completed)
            | (Running, TimedOut)
            | (Running, OutputCapped)
            | (Running, Cancelled) => true,
            _ => false,
        };

        if legal {
            *self = next;
        } else {
            tracing::trace!(from = ?*self, to = ?next, "Ignoring execution state transition");
        }
        legal
    }

    /// Status reported for a terminal state. `Completed` depends on the exit code.
    pub fn exit_status(self, exited_zero: bool) -> Option<ExitStatus> {
        match self {
            ExecutionState::Completed if exited_zero => Some(ExitStatus::Ok),
            ExecutionState::Completed => Some(ExitStatus::NonzeroExit),
            ExecutionState::TimedOut => Some(ExitStatus::Timeout),
            ExecutionState::OutputCapped => Some(ExitStatus::OutputTooLarge),
            ExecutionState::StartFailed | ExecutionState::Cancelled => {
                Some(ExitStatus::InternalError)
            }
            ExecutionState::Pending | ExecutionState::Running => None,
        }
    }
}
