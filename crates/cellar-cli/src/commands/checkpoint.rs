//! `cellar checkpoint`: manage checkpoint directories and drive criu.

use std::path::Path;
use std::process::Command;

use anyhow::Context;
use cellar_checkpoint::commands::{
    DUMP_LOG, PAGE_SERVER_LOG, PageServer, checkpoint_args, page_server_args,
};
use cellar_checkpoint::{CheckpointEntry, CheckpointKind, CheckpointManager};
use cellar_common::config::CellarConfig;
use clap::{Args, Subcommand};

use crate::output;

/// Arguments for the `checkpoint` command.
#[derive(Args, Debug)]
pub struct CheckpointArgs {
    /// Checkpoint operation.
    #[command(subcommand)]
    pub command: CheckpointCommand,
}

/// Checkpoint operations.
#[derive(Subcommand, Debug)]
pub enum CheckpointCommand {
    /// Create an empty checkpoint.
    Create {
        /// Checkpoint name.
        name: String,
        /// Keep images on volatile storage.
        #[arg(long)]
        memory: bool,
    },
    /// List checkpoints.
    List,
    /// Show one checkpoint.
    Info {
        /// Checkpoint name.
        name: String,
    },
    /// Switch a checkpoint between disk and memory images.
    Config {
        /// Checkpoint name.
        name: String,
        /// Target kind (`disk` or `memory`).
        #[arg(long)]
        kind: CheckpointKind,
    },
    /// Delete a checkpoint and its images.
    Delete {
        /// Checkpoint name.
        name: String,
    },
    /// Dump the process tree recorded in a checkpoint.
    Dump(DumpArgs),
    /// Receive pages for a checkpoint from a remote dump.
    PageServer {
        /// Checkpoint name.
        name: String,
        /// Address to listen on.
        #[arg(long, default_value = "0.0.0.0")]
        address: String,
        /// Port to listen on.
        #[arg(long)]
        port: u16,
    },
}

/// Arguments for `checkpoint dump`.
#[derive(Args, Debug)]
pub struct DumpArgs {
    /// Checkpoint name.
    pub name: String,
    /// Process tree to dump; defaults to the pid recorded at launch.
    #[arg(long)]
    pub pid: Option<i32>,
    /// Stream pages to a page server instead of local images.
    #[arg(long, value_name = "ADDR:PORT")]
    pub page_server: Option<PageServer>,
}

/// Executes the `checkpoint` command.
///
/// # Errors
///
/// Returns an error if the checkpoint operation fails.
pub fn execute(args: CheckpointArgs, config: &CellarConfig) -> anyhow::Result<()> {
    let manager = CheckpointManager::from_config(config);
    match args.command {
        CheckpointCommand::Create { name, memory } => {
            let kind = if memory {
                CheckpointKind::Memory
            } else {
                CheckpointKind::Disk
            };
            let entry = manager.create(&name, kind)?;
            println!("Created {kind} checkpoint {name} at {}", entry.path().display());
        }
        CheckpointCommand::List => list(&manager)?,
        CheckpointCommand::Info { name } => info(&manager.get(&name)?)?,
        CheckpointCommand::Config { name, kind } => {
            let entry = manager.config(&name, kind)?;
            println!("Checkpoint {name} now keeps {} images", entry.kind());
        }
        CheckpointCommand::Delete { name } => {
            manager.delete(&name)?;
            println!("Deleted checkpoint {name}");
        }
        CheckpointCommand::Dump(dump_args) => dump(&manager, &dump_args)?,
        CheckpointCommand::PageServer {
            name,
            address,
            port,
        } => {
            let entry = manager.get(&name)?;
            entry.sync()?;
            let paths = entry.host_paths()?;
            let argv = page_server_args(&paths, privileged(), &PageServer { address, port });
            run_criu(&argv, &paths.work_dir.join(PAGE_SERVER_LOG))?;
        }
    }
    Ok(())
}

fn privileged() -> bool {
    nix::unistd::geteuid().is_root()
}

fn list(manager: &CheckpointManager) -> anyhow::Result<()> {
    let entries = manager.list()?;
    if entries.is_empty() {
        println!("No checkpoints found.");
        return Ok(());
    }

    println!(
        "{:<24} {:<8} {:<10} {:<8} {:<20}",
        "NAME", "KIND", "SIZE", "PID", "MODIFIED"
    );
    for entry in &entries {
        let size = entry
            .host_paths()
            .map_or(0, |paths| output::dir_size(&paths.images_dir));
        println!(
            "{:<24} {:<8} {:<10} {:<8} {:<20}",
            entry.name(),
            entry.kind().to_string(),
            output::format_bytes(size),
            entry.pid().map_or_else(|_| "-".to_string(), |p| p.to_string()),
            entry
                .modified()
                .map_or_else(|_| "-".to_string(), |t| output::format_time(&t)),
        );
    }
    Ok(())
}

fn info(entry: &CheckpointEntry) -> anyhow::Result<()> {
    let paths = entry.host_paths()?;
    println!("Name:       {}", entry.name());
    println!("Kind:       {}", entry.kind());
    println!("Path:       {}", entry.path().display());
    println!("Images:     {}", paths.images_dir.display());
    println!("Size:       {}", output::format_bytes(output::dir_size(&paths.images_dir)));
    println!(
        "Pid:        {}",
        entry.pid().map_or_else(|_| "-".to_string(), |p| p.to_string())
    );
    println!(
        "Launch:     {}",
        if entry.config_path().is_file() { "saved" } else { "none" }
    );
    if let Ok(modified) = entry.modified() {
        println!("Modified:   {}", output::format_time(&modified));
    }
    Ok(())
}

fn dump(manager: &CheckpointManager, args: &DumpArgs) -> anyhow::Result<()> {
    let entry = manager.get(&args.name)?;
    entry.sync()?;
    let pid = match args.pid {
        Some(pid) => pid,
        None => entry
            .pid()
            .with_context(|| format!("no pid recorded for {}, pass --pid", args.name))?,
    };
    let paths = entry.host_paths()?;
    let argv = checkpoint_args(&paths, pid, privileged(), args.page_server.as_ref());
    tracing::info!(checkpoint = %args.name, pid, "dumping process tree");
    run_criu(&argv, &paths.work_dir.join(DUMP_LOG))?;
    println!("Dumped process {pid} into {}", args.name);
    Ok(())
}

fn run_criu(argv: &[String], log: &Path) -> anyhow::Result<()> {
    let (program, args) = argv.split_first().context("empty criu command line")?;
    tracing::debug!(?argv, "running criu");
    let status = Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("cannot run {program}"))?;
    if !status.success() {
        anyhow::bail!("{program} failed ({status}), see {}", log.display());
    }
    Ok(())
}
