//! The `start` subcommand.

use clap::Args;

use crate::{config::Config, prelude::*, ui::Ui};

use super::{build_controller, finish_run};

/// Start command line arguments.
#[derive(Debug, Args)]
pub struct StartOpts {
    /// The subject (book, document) to process. Also names the output and
    /// checkpoint files.
    #[clap(long)]
    pub subject: String,

    /// The number of pages in the subject.
    #[clap(long)]
    pub total_pages: u32,

    /// The first page to process.
    #[clap(long, default_value = "1")]
    pub start_page: u32,
}

/// The `start` subcommand.
#[instrument(level = "debug", skip_all, fields(subject = %opts.subject))]
pub async fn cmd_start(ui: &Ui, config: &Config, opts: &StartOpts) -> Result<i32> {
    let mut controller = build_controller(ui, config, &opts.subject)?;
    let setup = controller
        .initialize(&opts.subject, opts.total_pages, opts.start_page)
        .await;
    Ok(finish_run(&mut controller, setup).await)
}
