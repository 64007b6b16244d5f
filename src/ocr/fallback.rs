//! Try several engines in order.

use crate::{
    prelude::*,
    workflow::{OcrEngine, PageImage, RecognitionResult},
};

/// Uses the first engine that succeeds on a page.
pub struct FallbackEngine {
    engines: Vec<Box<dyn OcrEngine>>,
}

impl FallbackEngine {
    pub fn new(engines: Vec<Box<dyn OcrEngine>>) -> Self {
        Self { engines }
    }
}

#[async_trait]
impl OcrEngine for FallbackEngine {
    fn name(&self) -> &str {
        "fallback"
    }

    /// Usable if any engine is. Unusable engines are only logged.
    async fn check_available(&self) -> Result<()> {
        let mut problems = vec![];
        for engine in &self.engines {
            match engine.check_available().await {
                Ok(()) => {}
                Err(err) => {
                    warn!(engine = engine.name(), "OCR engine unavailable: {err:#}");
                    problems.push(format!("{}: {err:#}", engine.name()));
                }
            }
        }
        if problems.len() == self.engines.len() {
            Err(anyhow!("no OCR engine is available ({})", problems.join("; ")))
        } else {
            Ok(())
        }
    }

    async fn recognize(&self, image: &PageImage) -> RecognitionResult {
        let mut messages = vec![];
        for (idx, engine) in self.engines.iter().enumerate() {
            let result = engine.recognize(image).await;
            if result.success {
                if idx > 0 {
                    info!(page = image.page, engine = engine.name(), "Fallback engine succeeded");
                }
                return result;
            }
            let message = result.error_message.unwrap_or_default();
            debug!(page = image.page, engine = engine.name(), "Engine failed: {message}");
            messages.push(format!("{}: {message}", engine.name()));
        }
        RecognitionResult::failure(messages.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use image::DynamicImage;

    use super::*;

    struct Scripted {
        name: &'static str,
        works: bool,
    }

    impl Scripted {
        fn boxed(name: &'static str, works: bool) -> Box<dyn OcrEngine> {
            Box::new(Self { name, works })
        }
    }

    #[async_trait]
    impl OcrEngine for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn check_available(&self) -> Result<()> {
            if self.works { Ok(()) } else { Err(anyhow!("missing")) }
        }

        async fn recognize(&self, _image: &PageImage) -> RecognitionResult {
            if self.works {
                RecognitionResult::success(self.name, 0.8, vec![])
            } else {
                RecognitionResult::failure("broken")
            }
        }
    }

    fn page() -> PageImage {
        PageImage::new(1, DynamicImage::new_luma8(1, 1))
    }

    #[tokio::test]
    async fn uses_first_successful_engine() {
        let engine = FallbackEngine::new(vec![
            Scripted::boxed("primary", false),
            Scripted::boxed("secondary", true),
            Scripted::boxed("tertiary", true),
        ]);
        engine.check_available().await.unwrap();
        let result = engine.recognize(&page()).await;
        assert!(result.success);
        assert_eq!(result.text, "secondary");
    }

    #[tokio::test]
    async fn fails_when_every_engine_fails() {
        let engine = FallbackEngine::new(vec![
            Scripted::boxed("a", false),
            Scripted::boxed("b", false),
        ]);
        assert!(engine.check_available().await.is_err());
        let result = engine.recognize(&page()).await;
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("a: broken; b: broken"));
    }
}
