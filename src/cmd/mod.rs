//! Command-line entry points.
//!
//! Each subcommand returns the process exit status it wants.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    capture::capture_for_config,
    config::Config,
    ocr::ocr_engine_for_config,
    output::TextFileWriter,
    prelude::*,
    preprocess::ImagePreprocessor,
    state::CheckpointStore,
    ui::{BarProgressSink, LogProgressSink, Ui},
    workflow::{Collaborators, ProgressSink, WorkflowController, WorkflowError},
};

pub mod delete;
pub mod list;
pub mod resume;
pub mod start;
pub mod status;

/// Exit status for commands that did what they were asked.
pub const EXIT_OK: i32 = 0;

/// Exit status for commands that could not do what they were asked.
pub const EXIT_ERROR: i32 = 1;

/// Open the checkpoint store named by our config.
fn open_store(config: &Config) -> Result<CheckpointStore> {
    CheckpointStore::open(&config.state.state_dir).with_context(|| {
        format!(
            "cannot open state directory {}",
            config.state.state_dir.display()
        )
    })
}

/// Build a controller wired to the collaborators our config asks for.
fn build_controller(ui: &Ui, config: &Config, subject_id: &str) -> Result<WorkflowController> {
    let sink: Box<dyn ProgressSink> = if config.progress.show_progress_bar {
        Box::new(BarProgressSink::new(ui, subject_id))
    } else {
        Box::new(LogProgressSink::new(
            config.progress.log_every,
            config.progress.verbose,
        ))
    };
    let collaborators = Collaborators {
        capture: capture_for_config(&config.capture, &config.output),
        preprocessor: Box::new(ImagePreprocessor::new(config.preprocess.clone())),
        engine: ocr_engine_for_config(&config.recognition),
        writer: Box::new(TextFileWriter::new(&config.output)),
        sink,
    };
    Ok(WorkflowController::new(
        config.workflow.clone(),
        open_store(config)?,
        collaborators,
    ))
}

/// Cancel `token` when the operator presses Ctrl-C.
fn spawn_interrupt_listener(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received Ctrl-C, stopping after the current step");
                token.cancel();
            }
            Err(err) => error!("Cannot listen for Ctrl-C: {err}"),
        }
    })
}

/// Drive a prepared run to its end, print the summary and pick an exit
/// status.
///
/// `setup` is the result of `initialize` or `resume`.
async fn finish_run(
    controller: &mut WorkflowController,
    setup: Result<(), WorkflowError>,
) -> i32 {
    let listener = spawn_interrupt_listener(controller.interrupt_handle());
    let result = match setup {
        Ok(()) => controller.run_loop().await,
        Err(err) => Err(err),
    };
    listener.abort();
    debug!(state = %controller.state(), "Run ended");
    if let Some(record) = controller.record() {
        info!(output = %record.output_location, "Text written");
    }

    // The controller has already logged any error.
    let summary = controller.summary();
    println!("{summary}");
    match result {
        Ok(()) => summary.exit_code(),
        Err(err) => err.exit_code(),
    }
}
