//! The `status` subcommand.

use clap::Args;

use crate::{
    config::Config,
    prelude::*,
    progress::{elapsed, format_duration, percentage, render_bar},
    state::CheckpointSummary,
};

use super::{EXIT_ERROR, EXIT_OK, open_store};

/// Width of the bar in our status report.
const BAR_WIDTH: i32 = 30;

/// Status command line arguments.
#[derive(Debug, Args)]
pub struct StatusOpts {
    /// The subject to describe.
    #[clap(long)]
    pub subject: String,

    /// Print the checkpoint summary as JSON.
    #[clap(long)]
    pub json: bool,
}

/// The `status` subcommand.
#[instrument(level = "debug", skip_all, fields(subject = %opts.subject))]
pub async fn cmd_status(config: &Config, opts: &StatusOpts) -> Result<i32> {
    let store = open_store(config)?;
    let record = match store.load(&opts.subject) {
        Ok(record) => record,
        Err(err) if err.is_not_found() => {
            error!("{err}");
            return Ok(EXIT_ERROR);
        }
        Err(err) => return Err(err.into()),
    };
    let summary = CheckpointSummary::from(&record);
    if opts.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(EXIT_OK);
    }

    println!("Subject: {}", summary.subject_id);
    println!("Status: {}", summary.status);
    println!(
        "Pages: {}..={} (last completed: {})",
        summary.start_page, summary.total_pages, summary.last_completed_page
    );
    println!("Processed: {}", summary.processed_count);
    if summary.failed_pages.is_empty() {
        println!("Failed pages: none");
    } else {
        let pages = summary
            .failed_pages
            .iter()
            .map(|page| page.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        println!("Failed pages: {pages}");
    }
    println!("Last updated: {}", summary.last_updated_at.to_rfc3339());
    println!(
        "Time since start: {}",
        format_duration(elapsed(&record, record.last_updated_at))
    );
    println!("{}", render_bar(percentage(&record)?, BAR_WIDTH)?);
    if store.can_resume(&opts.subject) {
        println!("Resume with: page-ocr resume --subject {:?}", summary.subject_id);
    }
    Ok(EXIT_OK)
}
