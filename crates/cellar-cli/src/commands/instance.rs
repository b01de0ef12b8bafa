//! `cellar instance`: start container instances.
//!
//! A start never returns on success: the process turns into the Master of
//! the new container and exits with the container's status.

use std::collections::BTreeMap;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::Context;
use cellar_checkpoint::criu::{self, CriuConfig};
use cellar_checkpoint::{CheckpointEntry, CheckpointKind, CheckpointManager, RunKind};
use cellar_common::config::CellarConfig;
use cellar_common::types::BindPath;
use cellar_core::fd::InheritedDescriptors;
use cellar_runtime::bootstrap::{Bootstrap, locate_starter};
use cellar_runtime::engine::EngineConfig;
use cellar_runtime::engine::native::{
    CheckpointMode, CheckpointSpec, ContainerConfig, DEFAULT_PATH, RootFs,
};
use clap::{Args, Subcommand};

/// Arguments for the `instance` command.
#[derive(Args, Debug)]
pub struct InstanceArgs {
    /// Instance operation.
    #[command(subcommand)]
    pub command: InstanceCommand,
}

/// Instance operations.
#[derive(Subcommand, Debug)]
pub enum InstanceCommand {
    /// Start an instance from a root directory or filesystem image.
    Start(StartArgs),
}

/// Arguments for `instance start`.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Root filesystem: a directory or an image file.
    pub image: PathBuf,

    /// Instance name.
    pub name: String,

    /// Write the container pid to this file.
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// Bind a host path into the container (`src[:dst[:opts]]`).
    #[arg(long = "bind", short = 'B')]
    pub binds: Vec<BindPath>,

    /// Launch under checkpoint CKPT so it can be dumped later.
    #[arg(long, value_name = "CKPT", conflicts_with = "criu_restore")]
    pub criu_launch: Option<String>,

    /// Keep the checkpoint images in memory.
    #[arg(long, requires = "criu_launch")]
    pub memory: bool,

    /// Restore the instance from checkpoint CKPT.
    #[arg(long, value_name = "CKPT")]
    pub criu_restore: Option<String>,

    /// Filesystem type of an image root.
    #[arg(long, default_value = "squashfs")]
    pub fstype: String,

    /// Mount an image root read-write.
    #[arg(long)]
    pub writable: bool,

    /// Hostname inside the container.
    #[arg(long)]
    pub hostname: Option<String>,

    /// Give the container its own network namespace.
    #[arg(long)]
    pub net: bool,

    /// Environment variable (`KEY=VALUE`).
    #[arg(long = "env", short = 'e', value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Working directory inside the container.
    #[arg(long, default_value = "/")]
    pub cwd: PathBuf,

    /// User id to run as.
    #[arg(long)]
    pub uid: Option<u32>,

    /// Group id to run as.
    #[arg(long)]
    pub gid: Option<u32>,

    /// Command and arguments; defaults to `/bin/sh`.
    #[arg(last = true)]
    pub args: Vec<String>,
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

/// Executes the `instance` command.
///
/// # Errors
///
/// Returns an error if the instance cannot be started.
pub fn execute(
    args: InstanceArgs,
    config: &CellarConfig,
    inherited: &InheritedDescriptors,
) -> anyhow::Result<()> {
    match args.command {
        InstanceCommand::Start(args) => start(args, config, inherited),
    }
}

/// Root filesystem for `image`: directories are used in place, files are
/// loop-mounted under the data directory.
pub fn rootfs_for(image: &Path, name: &str, fstype: &str, writable: bool, data_dir: &Path) -> RootFs {
    if image.is_dir() {
        return RootFs::Directory {
            path: image.to_path_buf(),
        };
    }
    RootFs::Image {
        image: image.to_path_buf(),
        mount_point: data_dir.join("instances").join(name).join("rootfs"),
        fstype: fstype.to_string(),
        writable,
    }
}

/// Container config described by the command line.
pub fn container_config(args: &StartArgs, data_dir: &Path) -> anyhow::Result<ContainerConfig> {
    let image = std::path::absolute(&args.image)
        .with_context(|| format!("cannot resolve {}", args.image.display()))?;
    let argv = if args.args.is_empty() {
        vec!["/bin/sh".to_string()]
    } else {
        args.args.clone()
    };
    let rootfs = rootfs_for(&image, &args.name, &args.fstype, args.writable, data_dir);
    let mut container = ContainerConfig::new(&args.name, argv, rootfs);

    let mut env = BTreeMap::from([("PATH".to_string(), DEFAULT_PATH.to_string())]);
    env.extend(args.env.iter().cloned());
    container.process.env = env;
    container.process.cwd.clone_from(&args.cwd);
    container.process.uid = args.uid;
    container.process.gid = args.gid;
    container.namespaces.network = args.net;
    container.hostname.clone_from(&args.hostname);
    container.binds.clone_from(&args.binds);
    container.pid_file = args
        .pid_file
        .as_deref()
        .map(std::path::absolute)
        .transpose()
        .context("cannot resolve the pid file path")?;
    container.privileged = nix::unistd::geteuid().is_root();
    Ok(container)
}

fn log_owner(container: &ContainerConfig) -> u32 {
    container
        .process
        .uid
        .unwrap_or_else(|| nix::unistd::getuid().as_raw())
}

fn inject_criu(container: &mut ContainerConfig, config: &CellarConfig) -> anyhow::Result<()> {
    let _ = criu::installation_check();
    match CriuConfig::load(&config.criu_config) {
        Ok(criu) => container.binds.extend(criu.resolve()?),
        Err(e) => tracing::warn!(
            path = %config.criu_config.display(),
            error = %e,
            "no criu injection config, restore needs criu inside the image"
        ),
    }
    Ok(())
}

fn checkpoint_for_launch(manager: &CheckpointManager, name: &str, kind: CheckpointKind) -> anyhow::Result<CheckpointEntry> {
    match manager.config(name, kind) {
        Ok(entry) => Ok(entry),
        Err(e) if e.is_not_found() => Ok(manager.create(name, kind)?),
        Err(e) => Err(e.into()),
    }
}

fn start(args: StartArgs, config: &CellarConfig, inherited: &InheritedDescriptors) -> anyhow::Result<()> {
    let starter = locate_starter(config.starter.as_deref())?;
    let mut container = container_config(&args, &config.data_dir)?;
    let manager = CheckpointManager::from_config(config);

    let bootstrap = if let Some(name) = &args.criu_launch {
        let kind = if args.memory {
            CheckpointKind::Memory
        } else {
            CheckpointKind::Disk
        };
        let entry = checkpoint_for_launch(&manager, name, kind)?;
        entry.rollback_log_files(&container.name);
        let (stdout, stderr) = entry.open_log_files(&container.name, RunKind::Launch, log_owner(&container))?;

        container.binds.extend(entry.bind_paths()?);
        inject_criu(&mut container, config)?;
        container.checkpoint = Some(CheckpointSpec::from_entry(&entry, CheckpointMode::Launch));
        let engine_config = EngineConfig::new("checkpoint", &container)?;
        let saved = serde_json::to_vec_pretty(&engine_config)?;
        std::fs::write(entry.config_path(), saved)
            .with_context(|| format!("cannot save {}", entry.config_path().display()))?;

        let _ = inherited.close_files(&[stdout.as_raw_fd(), stderr.as_raw_fd()]);
        tracing::info!(instance = %container.name, checkpoint = %name, kind = %entry.kind(), "launching checkpointable instance");
        Bootstrap::new(starter, engine_config).with_stdio(stdout, stderr)
    } else if let Some(name) = &args.criu_restore {
        let entry = manager.get(name)?;
        entry.sync()?;
        let raw = std::fs::read(entry.config_path()).with_context(|| {
            format!("checkpoint {name} has no saved launch configuration, launch it with --criu-launch first")
        })?;
        let mut saved: ContainerConfig = EngineConfig::from_slice(&raw)?.decode()?;
        saved.checkpoint = Some(CheckpointSpec::from_entry(&entry, CheckpointMode::Restore));
        saved.privileged = container.privileged;
        if saved.name != container.name {
            tracing::warn!(saved = %saved.name, requested = %container.name, "restoring under the saved instance name");
        }
        let (stdout, stderr) = entry.open_log_files(&saved.name, RunKind::Restore, log_owner(&saved))?;
        let _ = inherited.close_files(&[stdout.as_raw_fd(), stderr.as_raw_fd()]);
        tracing::info!(instance = %saved.name, checkpoint = %name, "restoring instance");
        Bootstrap::new(starter, EngineConfig::new("checkpoint", &saved)?).with_stdio(stdout, stderr)
    } else {
        tracing::info!(instance = %container.name, "starting instance");
        Bootstrap::new(starter, EngineConfig::new("native", &container)?)
    };

    match bootstrap.run()? {}
}
