//! Configuration file support.
//!
//! Every section and every field is optional. Missing values fall back to the
//! defaults below.

use std::time::Duration;

use serde::Deserialize;

use crate::prelude::*;

/// Config file we look for in the working directory when `--config` is not
/// given.
pub const DEFAULT_CONFIG_FILE: &str = "page-ocr.toml";

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub workflow: WorkflowConfig,
    pub state: StateConfig,
    pub output: OutputConfig,
    pub capture: CaptureConfig,
    pub preprocess: PreprocessConfig,
    pub recognition: RecognitionConfig,
    pub progress: ProgressConfig,
}

impl Config {
    /// Load configuration from `path`, or from [`DEFAULT_CONFIG_FILE`] if it
    /// exists, or use built-in defaults.
    pub async fn load(path: Option<&Path>) -> Result<Config> {
        let path = match path {
            Some(path) => Some(path.to_owned()),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                tokio::fs::try_exists(&default)
                    .await
                    .unwrap_or(false)
                    .then_some(default)
            }
        };
        let Some(path) = path else {
            debug!("No config file, using defaults");
            return Ok(Config::default());
        };
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config = Config::from_toml(&text)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Parse and validate a TOML config.
    pub fn from_toml(text: &str) -> Result<Config> {
        let config = toml::from_str::<Config>(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that parse fine but make no sense.
    pub fn validate(&self) -> Result<()> {
        let workflow = &self.workflow;
        if workflow.max_attempts < 1 {
            return Err(anyhow!("workflow.max_attempts must be at least 1"));
        }
        if workflow.max_consecutive_failures < 1 {
            return Err(anyhow!("workflow.max_consecutive_failures must be at least 1"));
        }
        if workflow.checkpoint_interval < 1 {
            return Err(anyhow!("workflow.checkpoint_interval must be at least 1"));
        }
        if !(0.0..=1.0).contains(&workflow.low_confidence_threshold) {
            return Err(anyhow!(
                "workflow.low_confidence_threshold must be between 0.0 and 1.0"
            ));
        }
        if self.recognition.engines.is_empty() {
            return Err(anyhow!("recognition.engines must list at least one engine"));
        }
        if !(self.preprocess.upscale > 0.0 && self.preprocess.upscale.is_finite()) {
            return Err(anyhow!("preprocess.upscale must be a positive number"));
        }
        if self.progress.log_every < 1 {
            return Err(anyhow!("progress.log_every must be at least 1"));
        }
        if let CaptureConfig::Command { command, .. } = &self.capture {
            if command.is_empty() {
                return Err(anyhow!("capture.command must not be empty"));
            }
        }
        Ok(())
    }
}

/// How the page loop retries, checkpoints and gives up.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Attempts per step, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry. Doubles on each further retry.
    pub retry_delay_ms: u64,
    /// Upper bound for the retry delay.
    pub retry_delay_max_ms: u64,
    /// Abort the run after this many pages fail back to back.
    pub max_consecutive_failures: u32,
    /// Save a checkpoint every N pages (and after every failed page).
    pub checkpoint_interval: u32,
    /// Warn when recognition confidence drops below this.
    pub low_confidence_threshold: f32,
    /// Warn when a page takes longer than this.
    pub slow_page_secs: u64,
}

impl WorkflowConfig {
    pub fn slow_page(&self) -> Duration {
        Duration::from_secs(self.slow_page_secs)
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 500,
            retry_delay_max_ms: 10_000,
            max_consecutive_failures: 5,
            checkpoint_interval: 10,
            low_confidence_threshold: 0.5,
            slow_page_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StateConfig {
    pub state_dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("output/state"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub base_dir: PathBuf,
    /// Write a separator line after each page.
    pub page_separator: bool,
    pub trim_whitespace: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("output"),
            page_separator: true,
            trim_whitespace: true,
        }
    }
}

/// Where page images come from.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum CaptureConfig {
    /// Drive a live viewer with external commands.
    Command {
        /// Screenshot command. `{output}` is replaced with the image path.
        command: Vec<String>,
        /// Advances the viewer by one page.
        #[serde(default)]
        page_turn_command: Option<Vec<String>>,
        /// Finds and focuses the viewer. Must succeed before a run starts.
        #[serde(default)]
        locate_command: Option<Vec<String>>,
        #[serde(default = "default_page_turn_delay_ms")]
        page_turn_delay_ms: u64,
    },
    /// Replay page images saved earlier.
    Directory {
        source_dir: PathBuf,
        /// File name per page. `{page}` or `{page:04}` is replaced with the
        /// page number.
        #[serde(default = "default_file_pattern")]
        file_pattern: String,
    },
}

fn default_page_turn_delay_ms() -> u64 {
    1500
}

fn default_file_pattern() -> String {
    "page_{page:04}.png".to_owned()
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig::Directory {
            source_dir: PathBuf::from("pages"),
            file_pattern: default_file_pattern(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PreprocessConfig {
    pub contrast_stretch: bool,
    /// Otsu binarization.
    pub binarize: bool,
    pub trim_margins: bool,
    /// Pixels at or above this gray level count as margin.
    pub margin_threshold: u8,
    pub margin_padding: u32,
    pub upscale: f32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            contrast_stretch: true,
            binarize: true,
            trim_margins: true,
            margin_threshold: 240,
            margin_padding: 10,
            upscale: 1.0,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RecognitionConfig {
    /// The first engine is primary. The rest are tried in order when it
    /// fails.
    pub engines: Vec<EngineConfig>,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            engines: vec![EngineConfig::default()],
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum EngineConfig {
    Tesseract {
        #[serde(default = "default_lang")]
        lang: String,
        #[serde(default = "default_psm")]
        psm: u8,
        #[serde(default = "default_tesseract_binary")]
        binary: String,
    },
}

fn default_lang() -> String {
    "jpn".to_owned()
}

fn default_psm() -> u8 {
    6
}

fn default_tesseract_binary() -> String {
    "tesseract".to_owned()
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::Tesseract {
            lang: default_lang(),
            psm: default_psm(),
            binary: default_tesseract_binary(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ProgressConfig {
    pub show_progress_bar: bool,
    pub verbose: bool,
    /// When logging instead of drawing a bar, log every N pages.
    pub log_every: u32,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            show_progress_bar: true,
            verbose: false,
            log_every: 1,
        }
    }
}
