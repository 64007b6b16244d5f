//! Tesseract OCR engine.

use image::ImageFormat;

use crate::{
    async_utils::run_command,
    prelude::*,
    workflow::{OcrEngine, PageImage, RecognitionResult, TextBlock},
};

/// OCR engine wrapping the `tesseract` CLI tool.
pub struct TesseractEngine {
    binary: String,
    lang: String,
    psm: u8,
}

impl TesseractEngine {
    pub fn new(binary: String, lang: String, psm: u8) -> Self {
        Self { binary, lang, psm }
    }

    async fn run(&self, image: &PageImage) -> Result<RecognitionResult> {
        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        let source = image.image.clone();
        let save_path = input_path.clone();
        tokio::task::spawn_blocking(move || source.save_with_format(&save_path, ImageFormat::Png))
            .await
            .context("could not join image encoder")?
            .context("cannot write tesseract input file")?;

        // Run tesseract on the input file, with TSV output on stdout.
        let argv = vec![
            self.binary.clone(),
            input_path.display().to_string(),
            "stdout".to_owned(),
            "-l".to_owned(),
            self.lang.clone(),
            "--psm".to_owned(),
            self.psm.to_string(),
            "tsv".to_owned(),
        ];
        let output = run_command(&argv, &[]).await?;
        let tsv = String::from_utf8_lossy(&output.stdout);
        Ok(parse_tsv(&tsv, word_separator(&self.lang)))
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn check_available(&self) -> Result<()> {
        run_command(&[self.binary.clone(), "--version".to_owned()], &[])
            .await
            .with_context(|| format!("{} is not usable", self.binary))?;
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(page = image.page))]
    async fn recognize(&self, image: &PageImage) -> RecognitionResult {
        match self.run(image).await {
            Ok(result) => {
                debug!(
                    chars = result.text.chars().count(),
                    confidence = result.confidence,
                    "Recognized page"
                );
                result
            }
            Err(err) => RecognitionResult::failure(format!("{err:#}")),
        }
    }
}

/// Scripts that are written without spaces between words.
fn word_separator(lang: &str) -> &'static str {
    let unspaced = lang
        .split('+')
        .all(|code| code.starts_with("jpn") || code.starts_with("chi"));
    if unspaced { "" } else { " " }
}

/// One recognized word from a TSV row.
struct Word<'a> {
    line: (u32, u32, u32),
    left: u32,
    top: u32,
    width: u32,
    height: u32,
    confidence: f32,
    text: &'a str,
}

fn parse_word(row: &str) -> Option<Word<'_>> {
    let fields = row.splitn(12, '\t').collect::<Vec<_>>();
    if fields.len() != 12 || fields[0] != "5" {
        return None;
    }
    let num = |i: usize| fields[i].trim().parse::<u32>().ok();
    let confidence = fields[10].trim().parse::<f32>().ok()?;
    let text = fields[11].trim();
    if confidence < 0.0 || text.is_empty() {
        return None;
    }
    Some(Word {
        line: (num(2)?, num(3)?, num(4)?),
        left: num(6)?,
        top: num(7)?,
        width: num(8)?,
        height: num(9)?,
        confidence: confidence / 100.0,
        text,
    })
}

/// Rebuild text, confidence and per-line layout from `tesseract ... tsv`
/// output. Blocks are separated by blank lines.
pub fn parse_tsv(tsv: &str, separator: &str) -> RecognitionResult {
    let words = tsv.lines().skip(1).filter_map(parse_word).collect::<Vec<_>>();
    if words.is_empty() {
        return RecognitionResult::success("", 0.0, vec![]);
    }
    let confidence = words.iter().map(|w| w.confidence).sum::<f32>() / words.len() as f32;

    let mut text = String::new();
    let mut layout = Vec::<TextBlock>::new();
    let mut counts = Vec::<usize>::new();
    let mut current_line = None;
    for word in &words {
        if current_line == Some(word.line) {
            if let (Some(block), Some(count)) = (layout.last_mut(), counts.last_mut()) {
                text.push_str(separator);
                text.push_str(word.text);
                block.text.push_str(separator);
                block.text.push_str(word.text);
                let right = (block.left + block.width).max(word.left + word.width);
                let bottom = (block.top + block.height).max(word.top + word.height);
                block.left = block.left.min(word.left);
                block.top = block.top.min(word.top);
                block.width = right - block.left;
                block.height = bottom - block.top;
                block.confidence += word.confidence;
                *count += 1;
            }
            continue;
        }
        if let Some((block, ..)) = current_line {
            text.push_str(if block == word.line.0 { "\n" } else { "\n\n" });
        }
        current_line = Some(word.line);
        text.push_str(word.text);
        layout.push(TextBlock {
            text: word.text.to_owned(),
            left: word.left,
            top: word.top,
            width: word.width,
            height: word.height,
            confidence: word.confidence,
        });
        counts.push(1);
    }
    for (block, count) in layout.iter_mut().zip(counts) {
        block.confidence /= count as f32;
    }
    RecognitionResult::success(text, confidence, layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
1\t1\t0\t0\t0\t0\t0\t0\t600\t800\t-1\t
2\t1\t1\t0\t0\t0\t10\t10\t300\t40\t-1\t
5\t1\t1\t1\t1\t1\t10\t10\t50\t20\t90\tHello
5\t1\t1\t1\t1\t2\t70\t12\t60\t20\t80\tworld
5\t1\t1\t1\t2\t1\t10\t40\t40\t20\t70\tagain
5\t1\t2\t1\t1\t1\t10\t100\t30\t20\t60\tnext
5\t1\t2\t1\t1\t2\t50\t100\t30\t20\t-1\t
";

    #[test]
    fn rebuilds_lines_and_blocks() {
        let result = parse_tsv(TSV, " ");
        assert!(result.success);
        assert_eq!(result.text, "Hello world\nagain\n\nnext");
        assert!((result.confidence - 0.75).abs() < 1e-6);
        assert_eq!(result.layout.len(), 3);
        let first = &result.layout[0];
        assert_eq!(first.text, "Hello world");
        assert_eq!((first.left, first.top, first.width, first.height), (10, 10, 120, 22));
        assert!((first.confidence - 0.85).abs() < 1e-6);
    }

    #[test]
    fn japanese_is_joined_without_spaces() {
        assert_eq!(word_separator("jpn"), "");
        assert_eq!(word_separator("jpn+jpn_vert"), "");
        assert_eq!(word_separator("jpn+eng"), " ");
        let tsv = "header\n5\t1\t1\t1\t1\t1\t0\t0\t10\t10\t95\t日本\n5\t1\t1\t1\t1\t2\t10\t0\t10\t10\t95\t語\n";
        assert_eq!(parse_tsv(tsv, "").text, "日本語");
    }

    #[test]
    fn empty_output_is_a_successful_blank_page() {
        let result = parse_tsv("level\tpage_num\n", " ");
        assert!(result.success);
        assert!(result.text.is_empty());
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable_and_fails_softly() {
        let engine = TesseractEngine::new(
            "definitely-not-tesseract".to_owned(),
            "eng".to_owned(),
            6,
        );
        assert!(engine.check_available().await.is_err());
        let page = PageImage::new(1, image::DynamicImage::new_luma8(2, 2));
        let result = engine.recognize(&page).await;
        assert!(!result.success);
        assert!(result.error_message.is_some());
    }
}
