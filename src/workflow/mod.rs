//! The resumable page-processing workflow.

mod collaborators;
mod controller;
mod error;
mod summary;

pub use collaborators::{
    CaptureError, OcrEngine, PageCapture, PageImage, PagePreprocessor, PageWriter,
    PreprocessError, ProgressSink, RecognitionResult, TextBlock, WriteError,
};
pub use controller::{Collaborators, WorkflowController};
pub use error::{WorkflowError, WorkflowState};
pub use summary::RunSummary;
