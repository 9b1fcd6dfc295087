//! Concurrency slots and static resource ceilings

use crate::error::ValidationError;
use crate::types::{Submission, Target};
use goplay_common::{ResourceLimits, SandboxConfig};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// No slot became free within the admission timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("all {capacity} execution slots are busy")]
pub struct Busy {
    pub capacity: usize,
}

/// Fixed-size pool of execution slots plus the limits every execution runs under
#[derive(Debug)]
pub struct ResourceGovernor {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    admission_timeout: Duration,
    limits: ResourceLimits,
}

impl ResourceGovernor {
    pub fn new(capacity: usize, admission_timeout: Duration, limits: ResourceLimits) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            admission_timeout,
            limits,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(
            config.max_concurrent,
            config.admission_timeout,
            config.limits.clone(),
        )
    }

    /// Wait up to the admission timeout for a free slot
    pub async fn acquire_slot(&self) -> Result<ExecutionSlot, Busy> {
        let busy = Busy {
            capacity: self.capacity,
        };

        match tokio::time::timeout(
            self.admission_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(ExecutionSlot::new(permit)),
            // closed semaphore or timeout: either way nothing was admitted
            Ok(Err(_)) | Err(_) => Err(busy),
        }
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire_slot(&self) -> Result<ExecutionSlot, Busy> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map(ExecutionSlot::new)
            .map_err(|_| Busy {
                capacity: self.capacity,
            })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held
    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn admission_timeout(&self) -> Duration {
        self.admission_timeout
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Check the static ceilings that apply before anything is allocated
    pub fn check_submission(&self, submission: &Submission) -> Result<(), ValidationError> {
        if submission.len() > self.limits.max_source_bytes {
            return Err(ValidationError::SourceTooLarge {
                size: submission.len(),
                max: self.limits.max_source_bytes,
            });
        }
        if submission.is_empty() {
            return Err(ValidationError::EmptySource);
        }
        Ok(())
    }

    /// Wall-clock deadline for a target
    pub fn deadline_for(&self, target: Target) -> Duration {
        match target {
            Target::Run => self.limits.run_deadline,
            Target::CompileWasm => self.limits.compile_deadline,
            Target::Format => self.limits.format_deadline,
        }
    }

    /// The longest deadline of any target
    pub fn longest_deadline(&self) -> Duration {
        [Target::Run, Target::CompileWasm, Target::Format]
            .into_iter()
            .map(|t| self.deadline_for(t))
            .max()
            .unwrap_or_default()
    }
}

/// A held unit of concurrency capacity
///
/// Released by [`ExecutionSlot::release`] or on drop. Releasing twice is a no-op.
#[derive(Debug)]
pub struct ExecutionSlot {
    permit: Option<OwnedSemaphorePermit>,
}

impl ExecutionSlot {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        Self {
            permit: Some(permit),
        }
    }

    pub fn release(&mut self) {
        self.permit.take();
    }

    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }
}
