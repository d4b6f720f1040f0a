use std::time::Duration;

use thiserror::Error;

use crate::engine::types::WorkflowStatus;

/// Errors raised by the workflow engine, the manager and the factory.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A step failed after exhausting its retries.
    #[error("step '{step}' failed after {attempts} attempt(s): {message}")]
    StepExecution {
        step: String,
        attempts: u32,
        message: String,
    },

    /// A single step attempt exceeded its timeout.
    #[error("step '{step}' timed out after {timeout:?}")]
    StepTimeout { step: String, timeout: Duration },

    /// Cancellation was observed while a step was running.
    #[error("workflow cancelled")]
    Cancelled,

    #[error("workflow '{0}' already exists")]
    DuplicateWorkflowId(String),

    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("unknown workflow type '{0}' (expected one of: standard, firmware_first, bios, ipmi)")]
    UnknownWorkflowType(String),

    /// The workflow is not in a state that allows the requested operation.
    #[error("workflow '{id}' is {status}")]
    InvalidState { id: String, status: WorkflowStatus },

    /// A pending workflow was already handed to a runner.
    #[error("workflow '{0}' has already been started")]
    AlreadyStarted(String),

    /// Active workflows cannot be purged from the registry.
    #[error("workflow '{0}' is still active")]
    WorkflowActive(String),

    #[error("workflow store error: {0}")]
    Store(String),
}

impl WorkflowError {
    /// True when `err` carries a cancellation, either directly or through an
    /// `anyhow` chain returned by a step action.
    pub fn is_cancellation(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<WorkflowError>(),
                Some(WorkflowError::Cancelled)
            )
        })
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
