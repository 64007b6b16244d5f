//! The `list` subcommand.

use clap::Args;

use crate::{config::Config, prelude::*};

use super::{EXIT_OK, open_store};

/// List command line arguments.
#[derive(Debug, Args)]
pub struct ListOpts {
    /// Print the checkpoint summaries as a JSON array.
    #[clap(long)]
    pub json: bool,
}

/// The `list` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_list(config: &Config, opts: &ListOpts) -> Result<i32> {
    let store = open_store(config)?;
    let mut summaries = store.list()?;
    summaries.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(EXIT_OK);
    }
    if summaries.is_empty() {
        println!("No checkpoints in {}", store.dir().display());
        return Ok(EXIT_OK);
    }
    for summary in &summaries {
        println!(
            "{}\t{}\t{}/{}\t{} failed",
            summary.subject_id,
            summary.status,
            summary.last_completed_page,
            summary.total_pages,
            summary.failed_pages.len()
        );
    }
    Ok(EXIT_OK)
}
