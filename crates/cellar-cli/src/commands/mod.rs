//! CLI command definitions and dispatch.

pub mod checkpoint;
pub mod instance;

use std::path::PathBuf;

use cellar_common::config::CellarConfig;
use cellar_core::fd::InheritedDescriptors;
use clap::{Parser, Subcommand};

/// Cellar: a privileged container runtime with checkpoint and restore.
#[derive(Parser, Debug)]
#[command(name = "cellar", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Runtime configuration file (JSON).
    #[arg(long, global = true, env = "CELLAR_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run container instances.
    Instance(instance::InstanceArgs),
    /// Manage checkpoints.
    Checkpoint(checkpoint::CheckpointArgs),
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<CellarConfig> {
    let config = match path {
        Some(path) => CellarConfig::load(path)?,
        None => CellarConfig::discover()?,
    };
    Ok(config)
}

/// Dispatches the parsed CLI command to its handler.
///
/// `inherited` is the descriptor table the process started with.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli, inherited: &InheritedDescriptors) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_ref())?;
    match cli.command {
        Command::Instance(args) => instance::execute(args, &config, inherited),
        Command::Checkpoint(args) => checkpoint::execute(args, &config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_start_collects_binds_and_args() {
        let cli = Cli::try_parse_from([
            "cellar", "instance", "start", "/srv/rootfs", "web", "--bind", "/data:/data:ro",
            "--bind", "/logs", "--pid-file", "/run/web.pid", "--", "/bin/sh", "-c", "true",
        ])
        .unwrap();
        let Command::Instance(instance::InstanceArgs {
            command: instance::InstanceCommand::Start(start),
        }) = cli.command
        else {
            unreachable!("expected instance start");
        };
        assert_eq!(start.name, "web");
        assert_eq!(start.binds.len(), 2);
        assert!(start.binds[0].is_readonly());
        assert_eq!(start.args, ["/bin/sh", "-c", "true"]);
    }

    #[test]
    fn launch_and_restore_are_exclusive() {
        let parsed = Cli::try_parse_from([
            "cellar", "instance", "start", "/srv/rootfs", "web", "--criu-launch", "a",
            "--criu-restore", "a",
        ]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from(["cellar", "instance", "start", "/srv/rootfs", "web", "--memory"]);
        assert!(parsed.is_err(), "--memory needs --criu-launch");
    }

    #[test]
    fn dump_parses_page_server() {
        let cli = Cli::try_parse_from([
            "cellar", "checkpoint", "dump", "job", "--pid", "42", "--page-server", "10.0.0.2:2700",
        ])
        .unwrap();
        let Command::Checkpoint(checkpoint::CheckpointArgs {
            command: checkpoint::CheckpointCommand::Dump(dump),
        }) = cli.command
        else {
            unreachable!("expected checkpoint dump");
        };
        assert_eq!(dump.pid, Some(42));
        assert_eq!(dump.page_server.unwrap().port, 2700);
    }
}
