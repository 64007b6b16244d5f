//! Capture pages from a live document viewer using external commands.

use std::time::Duration;

use tokio::sync::Mutex;

use crate::{
    async_utils::run_command,
    prelude::*,
    state::safe_file_stem,
    workflow::{CaptureError, PageCapture, PageImage},
};

use super::load_image;

/// Where the viewer is, as far as we know.
#[derive(Debug, Default)]
struct Position {
    screenshot_dir: Option<PathBuf>,
    /// The page currently on screen. `None` until the first capture, which
    /// takes whatever is showing.
    page: Option<u32>,
}

/// Screenshots a viewer, turning pages as needed.
pub struct CommandCapture {
    command: Vec<String>,
    page_turn_command: Option<Vec<String>>,
    locate_command: Option<Vec<String>>,
    page_turn_delay: Duration,
    base_dir: PathBuf,
    position: Mutex<Position>,
}

impl CommandCapture {
    pub fn new(
        command: Vec<String>,
        page_turn_command: Option<Vec<String>>,
        locate_command: Option<Vec<String>>,
        page_turn_delay: Duration,
        base_dir: PathBuf,
    ) -> Self {
        Self {
            command,
            page_turn_command,
            locate_command,
            page_turn_delay,
            base_dir,
            position: Mutex::new(Position::default()),
        }
    }

    /// Turn forward until `page` is on screen. Never turns backwards, so a
    /// retry of the same page doesn't move the viewer.
    async fn turn_to(&self, position: &mut Position, page: u32) -> Result<(), CaptureError> {
        let current = *position.page.get_or_insert(page);
        if current >= page {
            return Ok(());
        }
        let Some(turn) = &self.page_turn_command else {
            debug!(page, "No page turn command, assuming the viewer advanced");
            position.page = Some(page);
            return Ok(());
        };
        for next in current + 1..=page {
            let next_page = next.to_string();
            run_command(turn, &[("page", next_page.as_str())])
                .await
                .map_err(|err| CaptureError::Command(format!("cannot turn to page {next}: {err:#}")))?;
            // Count each turn as it happens, so a failed retry resumes from
            // the right place.
            position.page = Some(next);
            tokio::time::sleep(self.page_turn_delay).await;
        }
        Ok(())
    }
}

#[async_trait]
impl PageCapture for CommandCapture {
    async fn prepare(&self, subject_id: &str) -> Result<String> {
        let dir = self
            .base_dir
            .join(format!("{}_screenshots", safe_file_stem(subject_id)));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("cannot create {}", dir.display()))?;
        Ok(dir.display().to_string())
    }

    async fn establish(&self, capture_location: &str) -> Result<()> {
        let dir = PathBuf::from(capture_location);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("cannot create {}", dir.display()))?;
        if let Some(locate) = &self.locate_command {
            run_command(locate, &[])
                .await
                .context("cannot locate the document viewer")?;
            info!("Located document viewer");
        }
        self.position.lock().await.screenshot_dir = Some(dir);
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn capture(&self, page: u32) -> Result<PageImage, CaptureError> {
        let mut position = self.position.lock().await;
        self.turn_to(&mut position, page).await?;

        let dir = position
            .screenshot_dir
            .clone()
            .ok_or_else(|| CaptureError::Command("capture target not established".to_owned()))?;
        let path = dir.join(format!("page_{page:04}.png"));
        let output = path.display().to_string();
        let page_number = page.to_string();
        run_command(
            &self.command,
            &[("output", output.as_str()), ("page", page_number.as_str())],
        )
        .await
        .map_err(|err| CaptureError::Command(format!("screenshot failed: {err:#}")))?;

        let image = load_image(&path).await?;
        Ok(PageImage {
            page,
            image,
            path: Some(path),
        })
    }
}
