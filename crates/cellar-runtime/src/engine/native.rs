//! The native engine: one command in a chroot behind optional namespaces.
//!
//! Stage2 asks the RPC server to assemble the root filesystem (loop-mounted
//! image, bind mounts) in the shared mount namespace, then runs the command
//! chrooted into it. With a PID namespace Stage2 stays behind as the
//! namespace's parent and relays signals; without one it execs the command
//! in place.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use cellar_checkpoint::CheckpointEntry;
use cellar_common::error::{CellarError, Result};
use cellar_common::types::{BindOption, BindPath};
use cellar_core::loop_device::{LO_FLAGS_AUTOCLEAR, LoopInfo, LoopMode};
use cellar_core::namespace::{self, NamespaceConfig};
use nix::mount::MsFlags;
use nix::unistd::{Gid, Pid, Uid};
use serde::{Deserialize, Serialize};

use super::{
    Creatable, CreatePlan, Engine, EngineConfig, MasterContext, Monitorable, RpcCapable,
    StartContext, Startable,
};
use crate::master::{Outcome, StatusReporter};
use crate::rpc::RpcClient;
use crate::signals;

/// `PATH` given to container processes that do not set one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

fn default_cwd() -> PathBuf {
    PathBuf::from("/")
}

/// The process run inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Program and arguments.
    pub args: Vec<String>,
    /// Complete environment; nothing is inherited.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory inside the container, created if missing.
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
    /// User to switch to.
    #[serde(default)]
    pub uid: Option<u32>,
    /// Group to switch to.
    #[serde(default)]
    pub gid: Option<u32>,
}

/// Where the container root comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RootFs {
    /// An unpacked directory on the host.
    Directory {
        /// Directory used as the root.
        path: PathBuf,
    },
    /// A filesystem image attached to a loop device.
    Image {
        /// Image file.
        image: PathBuf,
        /// Host directory the image is mounted on.
        mount_point: PathBuf,
        /// Filesystem type of the image.
        fstype: String,
        /// Mount read-write instead of read-only.
        #[serde(default)]
        writable: bool,
    },
}

impl RootFs {
    /// Host path of the assembled root.
    pub fn root(&self) -> &Path {
        match self {
            Self::Directory { path } => path,
            Self::Image { mount_point, .. } => mount_point,
        }
    }
}

/// Whether a checkpointable run starts fresh or from images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    /// Run the configured command so it can be dumped later.
    Launch,
    /// Run `criu restore` from the checkpoint images.
    Restore,
}

/// Checkpoint attached to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSpec {
    /// Host path of the checkpoint directory.
    pub path: PathBuf,
    /// Memory image root the checkpoint belongs to.
    pub tmpfs: PathBuf,
    /// Launch or restore.
    pub mode: CheckpointMode,
}

impl CheckpointSpec {
    /// Attaches `entry` in `mode`.
    pub fn from_entry(entry: &CheckpointEntry, mode: CheckpointMode) -> Self {
        Self {
            path: entry.path().to_path_buf(),
            tmpfs: entry.tmpfs().to_path_buf(),
            mode,
        }
    }

    /// Opens the attached checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is not a classifiable checkpoint.
    pub fn open(&self) -> Result<CheckpointEntry> {
        CheckpointEntry::open(&self.path, &self.tmpfs)
    }
}

/// Payload of the `native` and `checkpoint` engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Instance name.
    pub name: String,
    /// Container process.
    pub process: ProcessConfig,
    /// Root filesystem.
    pub rootfs: RootFs,
    /// Namespaces to create.
    #[serde(default)]
    pub namespaces: NamespaceConfig,
    /// Host paths bound into the root, in mount order.
    #[serde(default)]
    pub binds: Vec<BindPath>,
    /// Hostname set in the UTS namespace.
    #[serde(default)]
    pub hostname: Option<String>,
    /// File receiving the container pid.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    /// Checkpoint used by the `checkpoint` engine.
    #[serde(default)]
    pub checkpoint: Option<CheckpointSpec>,
    /// Whether the runtime runs with full privileges.
    #[serde(default)]
    pub privileged: bool,
}

impl ContainerConfig {
    /// A config running `args` in `rootfs` with the default namespaces.
    pub fn new(name: impl Into<String>, args: Vec<String>, rootfs: RootFs) -> Self {
        Self {
            name: name.into(),
            process: ProcessConfig {
                args,
                env: BTreeMap::from([("PATH".to_string(), DEFAULT_PATH.to_string())]),
                cwd: default_cwd(),
                uid: None,
                gid: None,
            },
            rootfs,
            namespaces: NamespaceConfig::default(),
            binds: Vec::new(),
            hostname: None,
            pid_file: None,
            checkpoint: None,
            privileged: false,
        }
    }

    /// Checks the config can be started.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CellarError::config("instance name must not be empty"));
        }
        if self.process.args.first().is_none_or(String::is_empty) {
            return Err(CellarError::config("container command is empty"));
        }
        if !self.process.cwd.is_absolute() {
            return Err(CellarError::config(format!(
                "working directory must be absolute: {}",
                self.process.cwd.display()
            )));
        }
        if !self.rootfs.root().is_absolute() {
            return Err(CellarError::config(format!(
                "root filesystem path must be absolute: {}",
                self.rootfs.root().display()
            )));
        }
        let mounts = !self.binds.is_empty() || matches!(self.rootfs, RootFs::Image { .. });
        if mounts && !self.namespaces.mount {
            return Err(CellarError::config(
                "bind mounts and image roots need a mount namespace",
            ));
        }
        if self.hostname.is_some() && !self.namespaces.uts {
            return Err(CellarError::config("a hostname needs a UTS namespace"));
        }
        if let Some(bind) = self.binds.iter().find(|b| !b.destination.is_absolute()) {
            return Err(CellarError::config(format!(
                "bind destination must be absolute: {}",
                bind.destination.display()
            )));
        }
        Ok(())
    }
}

/// Runs a command in a chroot.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeEngine;

impl Engine for NativeEngine {
    fn name(&self) -> &'static str {
        "native"
    }
}

impl Creatable for NativeEngine {
    fn create(&self, config: &EngineConfig) -> Result<CreatePlan> {
        let container: ContainerConfig = config.decode()?;
        container.validate()?;
        Ok(CreatePlan {
            namespaces: container.namespaces,
        })
    }
}

impl Startable for NativeEngine {
    fn start(&self, ctx: StartContext<'_>) -> Result<Infallible> {
        let container: ContainerConfig = ctx.config.decode()?;
        let argv = container.process.args.clone();
        launch(&container, argv, ctx)
    }

    fn post_start(&self, ctx: &MasterContext) -> Result<()> {
        let container: ContainerConfig = ctx.config.decode()?;
        write_pid_file(&container, ctx.process_pid);
        Ok(())
    }
}

impl Monitorable for NativeEngine {}

impl RpcCapable for NativeEngine {}

/// Records `pid` in the configured pid file; failures only warn.
pub fn write_pid_file(config: &ContainerConfig, pid: Pid) {
    let Some(path) = &config.pid_file else {
        return;
    };
    match std::fs::write(path, format!("{pid}\n")) {
        Ok(()) => tracing::debug!(path = %path.display(), %pid, "pid file written"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to write pid file"),
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| CellarError::config(format!("path is not UTF-8: {}", path.display())))
}

fn remount_flags(bind: &BindPath) -> Option<MsFlags> {
    let mut flags = MsFlags::empty();
    flags.set(MsFlags::MS_RDONLY, bind.is_readonly());
    flags.set(MsFlags::MS_NOSUID, bind.options.contains(&BindOption::Nosuid));
    flags.set(MsFlags::MS_NODEV, bind.options.contains(&BindOption::Nodev));
    (!flags.is_empty()).then(|| flags | MsFlags::MS_BIND | MsFlags::MS_REMOUNT)
}

/// Creates the mount point for `source` at `target`.
///
/// Directories go through the server. File targets are created here:
/// Stage2 shares the server's mount namespace and runs with the caller's
/// credentials, and the channel has no file-creation method.
fn ensure_mount_point<S: Read + Write>(
    rpc: &mut RpcClient<S>,
    source: &Path,
    target: &Path,
) -> Result<()> {
    if source.is_dir() {
        return rpc.mkdir(target, 0o755);
    }
    if let Some(parent) = target.parent() {
        rpc.mkdir(parent, 0o755)?;
    }
    if !target.exists() {
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(target)
            .map(drop)
            .map_err(|e| CellarError::io(target, e))?;
    }
    Ok(())
}

/// Assembles the container root through the RPC server and returns it.
///
/// Order: image attach and mount, binds in config order, then the server
/// chroots into the root and creates the working directory.
///
/// # Errors
///
/// Returns the first failed RPC call.
pub fn prepare_rootfs<S: Read + Write>(
    config: &ContainerConfig,
    rpc: &mut RpcClient<S>,
) -> Result<PathBuf> {
    if let RootFs::Image {
        image,
        mount_point,
        fstype,
        writable,
    } = &config.rootfs
    {
        let mode = if *writable {
            LoopMode::ReadWrite
        } else {
            LoopMode::ReadOnly
        };
        let info = LoopInfo {
            flags: LO_FLAGS_AUTOCLEAR,
            ..LoopInfo::default()
        };
        let device = rpc.loop_attach(image, mode, info)?;
        let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
        flags.set(MsFlags::MS_RDONLY, !*writable);
        rpc.mkdir(mount_point, 0o755)?;
        rpc.mount(Some(path_str(&device)?), mount_point, Some(fstype), flags, None)?;
        tracing::info!(image = %image.display(), device = %device.display(), "image mounted");
    }

    let root = config.rootfs.root().to_path_buf();
    for bind in &config.binds {
        let target = root.join(bind.destination.strip_prefix("/").unwrap_or(&bind.destination));
        ensure_mount_point(rpc, &bind.source, &target)?;
        rpc.mount(
            Some(path_str(&bind.source)?),
            &target,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None,
        )?;
        if let Some(flags) = remount_flags(bind) {
            rpc.mount(None, &target, None, flags, None)?;
        }
        tracing::debug!(source = %bind.source.display(), target = %target.display(), "bind mounted");
    }

    rpc.chroot(&root)?;
    rpc.mkdir(&config.process.cwd, 0o755)?;
    Ok(root)
}

fn enter_container(
    root: &Path,
    cwd: &Path,
    mount_proc: bool,
    uid: Option<u32>,
    gid: Option<u32>,
) -> std::io::Result<()> {
    nix::unistd::chroot(root)?;
    nix::unistd::chdir(cwd)?;
    if mount_proc {
        nix::mount::mount(
            Some("proc"),
            "/proc",
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None::<&str>,
        )?;
    }
    if let Some(gid) = gid.map(Gid::from_raw) {
        nix::unistd::setgroups(&[gid])?;
        nix::unistd::setgid(gid)?;
    }
    if let Some(uid) = uid {
        nix::unistd::setuid(Uid::from_raw(uid))?;
    }
    signals::unblock_forwarded()
}

/// Builds the command that enters `root` and runs `argv`.
///
/// # Errors
///
/// Returns a configuration error for an empty `argv`.
pub fn container_command(config: &ContainerConfig, root: &Path, argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| CellarError::config("container command is empty"))?;
    let mut command = Command::new(program);
    let _ = command.args(args).env_clear().envs(&config.process.env);

    let root = root.to_path_buf();
    let cwd = config.process.cwd.clone();
    let mount_proc = config.namespaces.pid;
    let (uid, gid) = (config.process.uid, config.process.gid);
    // SAFETY: the hook runs in the forked child before exec and only issues
    // system calls on values moved into it.
    let _ = unsafe {
        command.pre_exec(move || enter_container(&root, &cwd, mount_proc, uid, gid))
    };
    Ok(command)
}

fn supervise(mut child: Child, status: &mut StatusReporter) -> Result<Infallible> {
    let pid = i32::try_from(child.id()).map_err(|_| CellarError::Protocol {
        message: format!("container pid {} overflows i32", child.id()),
    })?;
    status.started(pid)?;
    let _relay = signals::spawn_forwarder(Pid::from_raw(pid))?;
    tracing::info!(pid, "container process started in a pid namespace");

    let exit = child.wait().map_err(|e| CellarError::io("container", e))?;
    let outcome = Outcome::from(exit);
    tracing::info!(pid, ?outcome, "container process exited");
    std::process::exit(outcome.exit_code())
}

/// Prepares the root, then spawns or execs `argv` inside it.
///
/// # Errors
///
/// Returns an error if root assembly, spawn, or exec fails.
pub fn launch(config: &ContainerConfig, argv: Vec<String>, ctx: StartContext<'_>) -> Result<Infallible> {
    let StartContext {
        mut rpc,
        status,
        main,
        ..
    } = ctx;
    let root = prepare_rootfs(config, &mut rpc)?;
    drop(rpc);

    if let Some(hostname) = config.hostname.clone() {
        main.execute(move || namespace::set_hostname(&hostname))??;
    }

    let program = argv.first().cloned().unwrap_or_default();
    let mut command = container_command(config, &root, &argv)?;
    if config.namespaces.pid {
        let child = main
            .execute(move || command.spawn())?
            .map_err(|e| CellarError::io(&program, e))?;
        return supervise(child, status);
    }

    tracing::info!(program, root = %root.display(), "executing container process");
    let error = main.execute(move || command.exec())?;
    Err(CellarError::io(program, error))
}
