//! The interfaces the page loop drives. Concrete implementations live in
//! [`crate::capture`], [`crate::preprocess`], [`crate::ocr`], [`crate::output`]
//! and [`crate::ui`].

use std::io;

use image::DynamicImage;

use crate::{prelude::*, progress::ProgressSample};

/// One captured page.
#[derive(Clone, Debug)]
pub struct PageImage {
    pub page: u32,
    pub image: DynamicImage,
    /// Where the image was saved, if anywhere.
    pub path: Option<PathBuf>,
}

impl PageImage {
    pub fn new(page: u32, image: DynamicImage) -> Self {
        Self {
            page,
            image,
            path: None,
        }
    }
}

/// A recognized line of text and where it was on the page.
#[derive(Clone, Debug, PartialEq)]
pub struct TextBlock {
    pub text: String,
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
    /// Between 0.0 and 1.0.
    pub confidence: f32,
}

/// What a recognition engine made of a page.
///
/// Engines report failure with `success = false` rather than an error, and the
/// page loop treats that as a recoverable failure.
#[derive(Clone, Debug, PartialEq)]
pub struct RecognitionResult {
    pub text: String,
    /// Between 0.0 and 1.0.
    pub confidence: f32,
    pub success: bool,
    pub error_message: Option<String>,
    pub layout: Vec<TextBlock>,
}

impl RecognitionResult {
    pub fn success(text: impl Into<String>, confidence: f32, layout: Vec<TextBlock>) -> Self {
        Self {
            text: text.into(),
            confidence,
            success: true,
            error_message: None,
            layout,
        }
    }

    pub fn failure(error_message: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
            success: false,
            error_message: Some(error_message.into()),
            layout: vec![],
        }
    }
}

/// Failure to get a page image.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The page isn't available yet. Worth trying again.
    #[error("page {page} is not ready: {reason}")]
    NotReady { page: u32, reason: String },

    #[error("{0}")]
    Command(String),

    #[error("cannot decode page image {path}: {message}")]
    Decode { path: String, message: String },

    #[error("I/O error during capture: {0}")]
    Io(#[from] io::Error),
}

/// Failure to normalize a page image.
#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("page image is empty")]
    EmptyImage,

    #[error("preprocessing failed: {0}")]
    Failed(String),
}

/// Failure to append text to the output.
#[derive(Debug, thiserror::Error)]
#[error("cannot {action} {path}: {source}")]
pub struct WriteError {
    pub action: &'static str,
    pub path: String,
    #[source]
    pub source: io::Error,
}

/// Produces page images, for example by screenshotting a document viewer.
#[async_trait]
pub trait PageCapture: Send + Sync + 'static {
    /// Create wherever this run's page images go, and return an opaque handle
    /// to it. Called once for a fresh run.
    async fn prepare(&self, subject_id: &str) -> Result<String>;

    /// Make sure the capture target exists and is usable. A failure here
    /// stops the run before it starts.
    async fn establish(&self, capture_location: &str) -> Result<()>;

    /// Capture `page`. Called with strictly increasing pages, except that a
    /// retry repeats the same page.
    async fn capture(&self, page: u32) -> Result<PageImage, CaptureError>;
}

/// Cleans up a page image before recognition.
#[async_trait]
pub trait PagePreprocessor: Send + Sync + 'static {
    async fn normalize(&self, image: &PageImage) -> Result<PageImage, PreprocessError>;
}

/// A text recognition engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// A short name for logs.
    fn name(&self) -> &str;

    /// Is the engine installed and usable?
    async fn check_available(&self) -> Result<()>;

    /// Recognize the text on a page.
    async fn recognize(&self, image: &PageImage) -> RecognitionResult;
}

/// Durably stores recognized text.
#[async_trait]
pub trait PageWriter: Send + Sync + 'static {
    /// Where the text for `subject_id` goes, as an opaque handle. Must not
    /// touch the output.
    fn destination(&self, subject_id: &str) -> String;

    /// Make `destination` empty for a fresh run.
    async fn prepare(&self, destination: &str) -> Result<()>;

    /// Append one page's text. Must be durable when this returns.
    async fn append(&self, page: u32, text: &str, destination: &str)
    -> Result<(), WriteError>;
}

/// Receives progress updates. Must return quickly, and a failure is only
/// ever logged.
pub trait ProgressSink: Send + Sync + 'static {
    fn publish(&self, sample: &ProgressSample) -> Result<()>;

    /// The run is over. `message` describes how it ended.
    fn finish(&self, _message: &str) {}
}
