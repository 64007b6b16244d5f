//! Asynchronous utilities for use with Tokio.
//!
//! Mostly this is about running external tools (screenshots, page turning,
//! OCR) without blocking the runtime.

use std::process::Output;

use tokio::process::Command;

use crate::prelude::*;

/// Replace `{name}` placeholders in a command argument.
pub fn substitute(arg: &str, replacements: &[(&str, &str)]) -> String {
    replacements
        .iter()
        .fold(arg.to_owned(), |arg, (name, value)| {
            arg.replace(&format!("{{{name}}}"), value)
        })
}

/// Run a command given as an argument vector, substituting placeholders, and
/// fail if it fails.
pub async fn run_command(argv: &[String], replacements: &[(&str, &str)]) -> Result<Output> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command is empty"))?;
    let args = args
        .iter()
        .map(|arg| substitute(arg, replacements))
        .collect::<Vec<_>>();
    trace!(%program, ?args, "Running command");
    let output = Command::new(program)
        .args(&args)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("cannot run {program}"))?;
    check_for_command_failure(program, &output)?;
    Ok(output)
}

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels.
pub fn check_for_command_failure(command_name: &str, output: &Output) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}
