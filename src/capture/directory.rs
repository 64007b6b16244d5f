//! Replay page images that were saved earlier.

use crate::{
    prelude::*,
    workflow::{CaptureError, PageCapture, PageImage},
};

use super::load_image;

/// Reads `page_0001.png`, `page_0002.png`, ... from a directory.
pub struct DirectoryCapture {
    source_dir: PathBuf,
    file_pattern: String,
}

impl DirectoryCapture {
    pub fn new(source_dir: PathBuf, file_pattern: String) -> Self {
        Self {
            source_dir,
            file_pattern,
        }
    }

    fn path_for(&self, page: u32) -> PathBuf {
        self.source_dir
            .join(format_page_pattern(&self.file_pattern, page))
    }
}

#[async_trait]
impl PageCapture for DirectoryCapture {
    async fn prepare(&self, _subject_id: &str) -> Result<String> {
        Ok(self.source_dir.display().to_string())
    }

    async fn establish(&self, capture_location: &str) -> Result<()> {
        let metadata = tokio::fs::metadata(capture_location)
            .await
            .with_context(|| format!("cannot find page directory {capture_location}"))?;
        if !metadata.is_dir() {
            return Err(anyhow!("{capture_location} is not a directory"));
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn capture(&self, page: u32) -> Result<PageImage, CaptureError> {
        let path = self.path_for(page);
        if !tokio::fs::try_exists(&path).await? {
            return Err(CaptureError::NotReady {
                page,
                reason: format!("{} does not exist", path.display()),
            });
        }
        let image = load_image(&path).await?;
        Ok(PageImage {
            page,
            image,
            path: Some(path),
        })
    }
}

/// Expand `{page}` or a zero-padded `{page:04}` in a file name pattern.
pub fn format_page_pattern(pattern: &str, page: u32) -> String {
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut rest = pattern;
    while let Some(start) = rest.find("{page") {
        out.push_str(&rest[..start]);
        let after = &rest[start + "{page".len()..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let suffix = &after[..end];
        match suffix.strip_prefix(':').map(|width| width.parse::<usize>()) {
            None if suffix.is_empty() => out.push_str(&page.to_string()),
            Some(Ok(width)) => out.push_str(&format!("{page:0width$}")),
            // Not ours, keep it as is.
            _ => out.push_str(&rest[start..start + "{page".len() + end + 1]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}
