//! # cellar
//!
//! Front end of the Cellar runtime: starts container instances and manages
//! the checkpoints they can be dumped to and restored from.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

mod commands;
mod logging;
mod output;

use cellar_core::fd::InheritedDescriptors;
use clap::Parser;

use crate::commands::Cli;

fn main() -> anyhow::Result<()> {
    logging::init();
    // Before anything below opens a file of its own.
    let inherited = InheritedDescriptors::capture().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "cannot list inherited descriptors");
        InheritedDescriptors::default()
    });
    let cli = Cli::parse();
    commands::execute(cli, &inherited)
}
