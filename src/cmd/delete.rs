//! The `delete` subcommand.

use clap::Args;

use crate::{config::Config, prelude::*};

use super::{EXIT_ERROR, EXIT_OK, open_store};

/// Delete command line arguments.
#[derive(Debug, Args)]
pub struct DeleteOpts {
    /// The subject whose checkpoint should be removed. The output text is
    /// left alone.
    #[clap(long)]
    pub subject: String,
}

/// The `delete` subcommand.
#[instrument(level = "debug", skip_all, fields(subject = %opts.subject))]
pub async fn cmd_delete(config: &Config, opts: &DeleteOpts) -> Result<i32> {
    let store = open_store(config)?;
    match store.delete(&opts.subject) {
        Ok(()) => {
            println!("Deleted checkpoint for {:?}", opts.subject);
            Ok(EXIT_OK)
        }
        Err(err) if err.is_not_found() => {
            error!("{err}");
            Ok(EXIT_ERROR)
        }
        Err(err) => Err(err.into()),
    }
}
