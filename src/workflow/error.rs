//! Controller states and errors.

use std::fmt;

use crate::state::StateError;

use super::collaborators::{CaptureError, PreprocessError, WriteError};

/// Exit status for a completed run.
pub const EXIT_COMPLETED: i32 = 0;
/// Exit status for a failed run, including runs that never started.
pub const EXIT_FAILED: i32 = 1;
/// Exit status for an interrupted, resumable run. Matches the shell's
/// convention for SIGINT.
pub const EXIT_ABORTED: i32 = 130;

/// Where the controller is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkflowState {
    Idle,
    Initializing,
    Resuming,
    Running,
    Completed,
    Aborted,
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Aborted | WorkflowState::Failed
        )
    }

    /// Process exit status for this state.
    pub fn exit_code(self) -> i32 {
        match self {
            WorkflowState::Completed => EXIT_COMPLETED,
            WorkflowState::Aborted => EXIT_ABORTED,
            _ => EXIT_FAILED,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowState::Idle => "idle",
            WorkflowState::Initializing => "initializing",
            WorkflowState::Resuming => "resuming",
            WorkflowState::Running => "running",
            WorkflowState::Completed => "completed",
            WorkflowState::Aborted => "aborted",
            WorkflowState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a run ended without completing.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// A fresh run could not be set up. Nothing was persisted.
    #[error("cannot start {subject_id:?}: {reason}")]
    Initialization { subject_id: String, reason: String },

    /// A saved run could not be resumed.
    #[error("cannot resume {subject_id:?}: {reason}")]
    Resume { subject_id: String, reason: String },

    /// The checkpoint could not be saved, even after retrying.
    #[error("cannot save checkpoint: {0}")]
    Persistence(#[source] StateError),

    /// The operator stopped the run. Progress was saved and the run can be
    /// resumed.
    #[error("interrupted")]
    Interrupted,

    /// Too many pages failed in a row.
    #[error("{count} consecutive pages failed, ending at page {last_page}")]
    TooManyFailures { count: u32, last_page: u32 },

    /// The controller was used out of order.
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: WorkflowState,
    },
}

impl WorkflowError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkflowError::Interrupted => EXIT_ABORTED,
            _ => EXIT_FAILED,
        }
    }
}

/// The step of a page that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Capture,
    Preprocess,
    Recognize,
    Write,
    Checkpoint,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Capture => "capture",
            Step::Preprocess => "preprocess",
            Step::Recognize => "recognize",
            Step::Write => "write",
            Step::Checkpoint => "checkpoint",
        };
        f.write_str(name)
    }
}

/// A single failed attempt at a step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    #[error("recognition failed: {0}")]
    Recognition(String),

    #[error(transparent)]
    Write(#[from] WriteError),

    /// Not really a failure. Stops the retry loop immediately.
    #[error("interrupted")]
    Interrupted,
}
