//! Checkpoint persistence for resumable runs.

mod error;
mod record;
mod store;

pub use error::StateError;
pub use record::{InvariantViolation, ProgressRecord, RunStatus};
pub use store::{CheckpointStore, CheckpointSummary, safe_file_stem};
