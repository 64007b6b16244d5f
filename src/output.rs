//! Writing recognized text to disk.

use tokio::{fs::OpenOptions, io::AsyncWriteExt as _};

use crate::{
    config::OutputConfig,
    prelude::*,
    state::safe_file_stem,
    workflow::{PageWriter, WriteError},
};

/// Width of the line between pages.
const SEPARATOR_WIDTH: usize = 80;

/// Appends each page to `<base_dir>/<subject>.txt`.
pub struct TextFileWriter {
    base_dir: PathBuf,
    page_separator: bool,
    trim_whitespace: bool,
}

impl TextFileWriter {
    pub fn new(config: &OutputConfig) -> Self {
        Self {
            base_dir: config.base_dir.clone(),
            page_separator: config.page_separator,
            trim_whitespace: config.trim_whitespace,
        }
    }

    fn format_page(&self, text: &str) -> String {
        let text = if self.trim_whitespace { text.trim() } else { text };
        let mut chunk = String::with_capacity(text.len() + SEPARATOR_WIDTH + 4);
        chunk.push_str(text);
        chunk.push('\n');
        if self.page_separator {
            chunk.push('\n');
            chunk.push_str(&"=".repeat(SEPARATOR_WIDTH));
            chunk.push_str("\n\n");
        }
        chunk
    }
}

#[async_trait]
impl PageWriter for TextFileWriter {
    fn destination(&self, subject_id: &str) -> String {
        self.base_dir
            .join(format!("{}.txt", safe_file_stem(subject_id)))
            .display()
            .to_string()
    }

    /// Create an empty output file, replacing any earlier run's text.
    async fn prepare(&self, destination: &str) -> Result<()> {
        let path = Path::new(destination);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        let file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("cannot create {destination}"))?;
        file.sync_all()
            .await
            .with_context(|| format!("cannot sync {destination}"))?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, text))]
    async fn append(&self, page: u32, text: &str, destination: &str) -> Result<(), WriteError> {
        let error = |action: &'static str| {
            move |source| WriteError {
                action,
                path: destination.to_owned(),
                source,
            }
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(destination)
            .await
            .map_err(error("open"))?;
        file.write_all(self.format_page(text).as_bytes())
            .await
            .map_err(error("write"))?;
        file.sync_all().await.map_err(error("sync"))?;
        Ok(())
    }
}
