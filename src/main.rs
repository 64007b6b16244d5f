use std::{process::ExitCode, str::FromStr};

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{config::Config, prelude::*, ui::Ui};

mod async_utils;
mod capture;
mod cmd;
mod config;
mod ocr;
mod output;
mod prelude;
mod preprocess;
mod progress;
mod retry;
mod state;
mod ui;
mod workflow;

/// Capture, OCR and save a document page by page, with resumable runs.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Exit Status:
  0    The run completed, or the command succeeded.
  1    The run failed, or the command could not do what was asked.
  130  The run was interrupted. Continue it with `resume`.

Configuration:
  Settings are read from `--config`, or from `page-ocr.toml` in the
  current directory when present. Environment variables may be set in
  a standard `.env` file. `RUST_LOG` overrides the log level.
"#
)]
struct Opts {
    /// Path to a TOML config file.
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding checkpoint files. Overrides the config file.
    #[clap(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Log debug output and detailed progress.
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Start a new run for a subject.
    Start(cmd::start::StartOpts),
    /// Continue an interrupted run from its checkpoint.
    Resume(cmd::resume::ResumeOpts),
    /// Show the checkpoint for a subject.
    Status(cmd::status::StatusOpts),
    /// List every checkpoint.
    List(cmd::list::ListOpts),
    /// Delete the checkpoint for a subject.
    Delete(cmd::delete::DeleteOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Start(_) | Cmd::Resume(_) => false,
            Cmd::Status(_) | Cmd::List(_) | Cmd::Delete(_) => true,
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<ExitCode> {
    let ui = Ui::init();

    // Parse command-line arguments first, because `--verbose` affects logging.
    let opts = Opts::parse();

    // Initialize tracing.
    let level = if opts.verbose { "debug" } else { "info" };
    let directive = Directive::from_str(level)?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    let code = real_main(ui, opts).await?;
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui, opts: Opts) -> Result<i32> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();
    debug!("Parsed options: {:?}", opts);

    let mut config = Config::load(opts.config.as_deref()).await?;
    if let Some(state_dir) = &opts.state_dir {
        config.state.state_dir = state_dir.clone();
    }
    if opts.verbose {
        config.progress.verbose = true;
    }

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Start(start_opts) => cmd::start::cmd_start(&ui, &config, start_opts).await,
        Cmd::Resume(resume_opts) => cmd::resume::cmd_resume(&ui, &config, resume_opts).await,
        Cmd::Status(status_opts) => cmd::status::cmd_status(&config, status_opts).await,
        Cmd::List(list_opts) => cmd::list::cmd_list(&config, list_opts).await,
        Cmd::Delete(delete_opts) => cmd::delete::cmd_delete(&config, delete_opts).await,
    }
}
