//! Image cleanup before recognition.

use image::{
    DynamicImage, GrayImage, Luma,
    imageops::{self, FilterType},
};

use crate::{
    config::PreprocessConfig,
    prelude::*,
    workflow::{PageImage, PagePreprocessor, PreprocessError},
};

/// Grayscale, stretch, trim, scale and binarize, as configured.
pub struct ImagePreprocessor {
    config: PreprocessConfig,
}

impl ImagePreprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PagePreprocessor for ImagePreprocessor {
    #[instrument(level = "debug", skip_all, fields(page = image.page))]
    async fn normalize(&self, image: &PageImage) -> Result<PageImage, PreprocessError> {
        let config = self.config.clone();
        let source = image.image.clone();
        let gray = tokio::task::spawn_blocking(move || normalize_image(&config, &source))
            .await
            .map_err(|err| PreprocessError::Failed(err.to_string()))??;
        Ok(PageImage::new(image.page, DynamicImage::ImageLuma8(gray)))
    }
}

/// The whole pipeline, on the calling thread.
pub fn normalize_image(
    config: &PreprocessConfig,
    image: &DynamicImage,
) -> Result<GrayImage, PreprocessError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(PreprocessError::EmptyImage);
    }
    let mut gray = image.to_luma8();
    if config.contrast_stretch {
        stretch_contrast(&mut gray);
    }
    if config.trim_margins {
        gray = trim_margins(&gray, config.margin_threshold, config.margin_padding);
    }
    if (config.upscale - 1.0).abs() > f32::EPSILON {
        let width = ((gray.width() as f32) * config.upscale).round().max(1.0) as u32;
        let height = ((gray.height() as f32) * config.upscale).round().max(1.0) as u32;
        gray = imageops::resize(&gray, width, height, FilterType::Lanczos3);
    }
    if config.binarize {
        let threshold = otsu_threshold(&gray);
        binarize(&mut gray, threshold);
    }
    Ok(gray)
}

/// Stretch gray levels linearly so the darkest pixel is 0 and the lightest is
/// 255.
pub fn stretch_contrast(image: &mut GrayImage) {
    let (min, max) = image
        .pixels()
        .fold((u8::MAX, u8::MIN), |(min, max), Luma([v])| {
            (min.min(*v), max.max(*v))
        });
    if max <= min {
        return;
    }
    let range = f32::from(max - min);
    for Luma([v]) in image.pixels_mut() {
        *v = ((f32::from(*v - min) * 255.0) / range).round() as u8;
    }
}

/// Crop away near-white borders, keeping `padding` pixels around the
/// content. Pages with no content are returned unchanged.
pub fn trim_margins(image: &GrayImage, threshold: u8, padding: u32) -> GrayImage {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, Luma([v])) in image.enumerate_pixels() {
        if *v < threshold {
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
    }
    let Some((x0, y0, x1, y1)) = bounds else {
        return image.clone();
    };
    let left = x0.saturating_sub(padding);
    let top = y0.saturating_sub(padding);
    let right = x1.saturating_add(padding).min(image.width() - 1);
    let bottom = y1.saturating_add(padding).min(image.height() - 1);
    imageops::crop_imm(image, left, top, right - left + 1, bottom - top + 1).to_image()
}

/// Otsu's threshold: the gray level that best separates the histogram into
/// two classes.
pub fn otsu_threshold(image: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for Luma([v]) in image.pixels() {
        histogram[usize::from(*v)] += 1;
    }
    let total = f64::from(image.width()) * f64::from(image.height());
    let weighted_total = histogram
        .iter()
        .enumerate()
        .map(|(level, count)| level as f64 * *count as f64)
        .sum::<f64>();

    let (mut background, mut background_sum) = (0.0, 0.0);
    let (mut best, mut best_variance) = (0u8, -1.0);
    for (level, count) in histogram.iter().enumerate() {
        background += *count as f64;
        if background == 0.0 {
            continue;
        }
        let foreground = total - background;
        if foreground == 0.0 {
            break;
        }
        background_sum += level as f64 * *count as f64;
        let mean_background = background_sum / background;
        let mean_foreground = (weighted_total - background_sum) / foreground;
        let variance =
            background * foreground * (mean_background - mean_foreground).powi(2);
        if variance > best_variance {
            best_variance = variance;
            best = level as u8;
        }
    }
    best
}

/// Pixels above `threshold` become white, the rest black.
pub fn binarize(image: &mut GrayImage, threshold: u8) {
    for Luma([v]) in image.pixels_mut() {
        *v = if *v > threshold { 255 } else { 0 };
    }
}
