//! OCR engine selection.

use crate::{
    config::{EngineConfig, RecognitionConfig},
    workflow::OcrEngine,
};

pub mod fallback;
pub mod tesseract;

/// Build one engine.
fn ocr_engine_for_engine_config(config: &EngineConfig) -> Box<dyn OcrEngine> {
    match config {
        EngineConfig::Tesseract { lang, psm, binary } => Box::new(
            tesseract::TesseractEngine::new(binary.clone(), lang.clone(), *psm),
        ),
    }
}

/// Get the OCR engine for our config. Extra engines become fallbacks for the
/// first.
pub fn ocr_engine_for_config(config: &RecognitionConfig) -> Box<dyn OcrEngine> {
    let mut engines = config
        .engines
        .iter()
        .map(ocr_engine_for_engine_config)
        .collect::<Vec<_>>();
    if engines.len() == 1 {
        engines.remove(0)
    } else {
        Box::new(fallback::FallbackEngine::new(engines))
    }
}
