//! Checkpoint store errors.

use std::io;

/// An error reported by [`super::CheckpointStore`].
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// No checkpoint exists for this subject.
    #[error("no checkpoint found for {subject_id:?}")]
    NotFound { subject_id: String },

    /// A checkpoint exists, but it cannot be turned into a valid record.
    #[error("checkpoint {path} is corrupt: {reason}")]
    CorruptState { path: String, reason: String },

    /// Reading or writing the durable medium failed. Never retried here.
    #[error("failed to {action} checkpoint {path}: {source}")]
    Persistence {
        action: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },
}

impl StateError {
    pub(crate) fn corrupt(path: impl Into<String>, reason: impl ToString) -> Self {
        StateError::CorruptState {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn persistence(
        action: &'static str,
        path: impl Into<String>,
        source: io::Error,
    ) -> Self {
        StateError::Persistence {
            action,
            path: path.into(),
            source,
        }
    }

    /// Is this the "no checkpoint" case?
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound { .. })
    }
}
