//! Application UI: progress bars, and a stderr writer that cooperates with
//! them.
//!
//! This is adapted from `substudy` by Eric Kidd, which is licensed under
//! Apache-2.0 OR MIT. Used with permission.

use std::{io, sync::Arc, time::Duration};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::{
    prelude::*,
    progress::{self, ProgressSample},
    workflow::ProgressSink,
};

/// Width of the text bar written to the log.
const LOG_BAR_WIDTH: i32 = 30;

/// Application UI state.
#[derive(Clone)]
pub struct Ui {
    /// Our progress bars.
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    /// Create a new UI.
    pub fn init() -> Ui {
        let multi_progress = Arc::new(MultiProgress::new());
        Ui { multi_progress }
    }

    /// Create a new UI for unit tests.
    #[cfg(test)]
    pub fn init_for_tests() -> Ui {
        let multi_progress =
            Arc::new(MultiProgress::with_draw_target(ProgressDrawTarget::hidden()));
        Ui { multi_progress }
    }

    /// Hide all our progress bars completely, for when we're writing actual
    /// output to `stdout`.
    pub fn hide_progress_bars(&self) {
        self.multi_progress
            .set_draw_target(ProgressDrawTarget::hidden());
    }

    /// Get a writer than can be used to write to stderr, for use with `tracing`
    /// and other output code.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// Get a reference to our progress bars.
    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi_progress
    }

    /// Create a page progress bar for one subject. Its length is set once
    /// we know how many pages there are.
    pub fn new_page_bar(&self, subject_id: &str) -> ProgressBar {
        let pb = ProgressBar::new(0).with_style(page_progress_style());
        let pb = self.multi_progress.add(pb);
        #[cfg(test)]
        pb.set_draw_target(ProgressDrawTarget::hidden());
        pb.set_prefix(subject_id.to_owned());
        pb.enable_steady_tick(Duration::from_millis(250));
        pb
    }
}

fn page_progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {prefix:20!} {pos:>4}/{len:4} {elapsed_precise} {wide_bar:.cyan/blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// A writer which can used to write to `stderr`. It will hide and show progress
/// bars as needed, so that they don't interfere with the output.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

// The `tracing-indicatif` crate suggests that we should implement the following
// methods.
impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.multi_progress().suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.multi_progress().suspend(|| io::stderr().flush())
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.ui
            .multi_progress()
            .suspend(|| io::stderr().write_vectored(bufs))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui
            .multi_progress()
            .suspend(|| io::stderr().write_all(buf))
    }

    fn write_fmt(&mut self, fmt: std::fmt::Arguments<'_>) -> io::Result<()> {
        self.ui
            .multi_progress()
            .suspend(|| io::stderr().write_fmt(fmt))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Shows progress as an `indicatif` bar.
pub struct BarProgressSink {
    bar: ProgressBar,
}

impl BarProgressSink {
    pub fn new(ui: &Ui, subject_id: &str) -> Self {
        Self {
            bar: ui.new_page_bar(subject_id),
        }
    }
}

impl ProgressSink for BarProgressSink {
    fn publish(&self, sample: &ProgressSample) -> Result<()> {
        let record = &sample.record;
        let remaining = progress::estimate_remaining(record, &sample.timings)?;
        self.bar.set_length(u64::from(record.total_pages));
        self.bar.set_position(u64::from(record.last_completed_page));
        let message = if record.failed_pages.is_empty() {
            format!("ETA {remaining}")
        } else {
            format!("{} failed, ETA {remaining}", record.failed_pages.len())
        };
        self.bar.set_message(message);
        Ok(())
    }

    fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_owned());
    }
}

/// Writes progress to the log every `log_every` concluded pages. Used when
/// the bar is disabled.
pub struct LogProgressSink {
    log_every: u32,
    verbose: bool,
}

impl LogProgressSink {
    pub fn new(log_every: u32, verbose: bool) -> Self {
        Self {
            log_every: log_every.max(1),
            verbose,
        }
    }
}

impl ProgressSink for LogProgressSink {
    fn publish(&self, sample: &ProgressSample) -> Result<()> {
        let record = &sample.record;
        if record.pages_concluded() % self.log_every != 0 {
            return Ok(());
        }
        let bar = progress::render_bar(progress::percentage(record)?, LOG_BAR_WIDTH)?;
        let lines = progress::display_lines(sample, self.verbose)?;
        info!(subject = %record.subject_id, "{bar}\n{lines}");
        if self.verbose {
            let summary = progress::summary(sample)?;
            debug!(metrics = %serde_json::Value::Object(summary.to_map()), "Progress metrics");
        }
        Ok(())
    }

    fn finish(&self, message: &str) {
        info!("{message}");
    }
}
