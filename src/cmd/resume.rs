//! The `resume` subcommand.

use clap::Args;

use crate::{config::Config, prelude::*, ui::Ui};

use super::{build_controller, finish_run};

/// Resume command line arguments.
#[derive(Debug, Args)]
pub struct ResumeOpts {
    /// The subject whose interrupted run should continue.
    #[clap(long)]
    pub subject: String,
}

/// The `resume` subcommand. Picks up at the page after the last one the
/// checkpoint recorded.
#[instrument(level = "debug", skip_all, fields(subject = %opts.subject))]
pub async fn cmd_resume(ui: &Ui, config: &Config, opts: &ResumeOpts) -> Result<i32> {
    let mut controller = build_controller(ui, config, &opts.subject)?;
    let setup = controller.resume(&opts.subject).await;
    Ok(finish_run(&mut controller, setup).await)
}
