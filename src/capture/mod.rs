//! Page image sources.

use image::DynamicImage;

use crate::{
    config::{CaptureConfig, OutputConfig},
    prelude::*,
    workflow::{CaptureError, PageCapture},
};

pub mod command;
pub mod directory;

/// Build the page source described by `config`.
pub fn capture_for_config(
    config: &CaptureConfig,
    output: &OutputConfig,
) -> Box<dyn PageCapture> {
    match config {
        CaptureConfig::Command {
            command,
            page_turn_command,
            locate_command,
            page_turn_delay_ms,
        } => Box::new(command::CommandCapture::new(
            command.clone(),
            page_turn_command.clone(),
            locate_command.clone(),
            std::time::Duration::from_millis(*page_turn_delay_ms),
            output.base_dir.clone(),
        )),
        CaptureConfig::Directory {
            source_dir,
            file_pattern,
        } => Box::new(directory::DirectoryCapture::new(
            source_dir.clone(),
            file_pattern.clone(),
        )),
    }
}

/// Read and decode an image file without blocking the runtime.
pub(crate) async fn load_image(path: &Path) -> Result<DynamicImage, CaptureError> {
    let data = tokio::fs::read(path).await?;
    let display = path.display().to_string();
    let decoded = tokio::task::spawn_blocking(move || image::load_from_memory(&data))
        .await
        .map_err(|err| CaptureError::Decode {
            path: display.clone(),
            message: err.to_string(),
        })?;
    decoded.map_err(|err| CaptureError::Decode {
        path: display,
        message: err.to_string(),
    })
}
