//! Launching the stage pipeline from the CLI process.
//!
//! The bootstrap writes the shared segment, runs Stage1 for the namespace
//! plan, starts the RPC server in a fresh mount namespace, starts Stage2
//! inside it, then replaces itself with the Master so that the Master is
//! Stage2's parent. Every descriptor a stage inherits is placed at its fixed
//! number in the child right before exec; everything else is close-on-exec.

use std::convert::Infallible;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::FileExt;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use cellar_common::constants::{
    MASTER_FD, MASTER_PEER_FD, RPC_CLIENT_FD, RPC_SERVER_FD, SCONFIG_FD, SCONFIG_FD_ENV, STAGE_ENV,
    STARTER_BIN,
};
use cellar_common::error::{CellarError, Result};
use cellar_common::types::Stage;
use cellar_core::{fd, memfd, namespace};
use nix::mount::MsFlags;
use nix::sched::CloneFlags;

use crate::engine::{CreatePlan, EngineConfig};
use crate::shared_config::{self, PID_OFFSET, SegmentHeader};

/// Lowest number source descriptors are moved to, clear of the fixed slots.
const STAGING_FD: RawFd = 10;

/// Finds the starter binary.
///
/// Tries the configured path, then a `cellar-starter` next to the running
/// executable, then `PATH`.
///
/// # Errors
///
/// Returns [`CellarError::NotFound`] if a configured path does not exist or
/// no starter can be found.
pub fn locate_starter(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(CellarError::NotFound {
            kind: "starter",
            id: path.display().to_string(),
        });
    }
    let sibling = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(STARTER_BIN)))
        .filter(|path| path.is_file());
    if let Some(path) = sibling {
        return Ok(path);
    }
    which::which(STARTER_BIN).map_err(|_| CellarError::NotFound {
        kind: "starter",
        id: STARTER_BIN.to_string(),
    })
}

/// Moves `fd` out of the fixed descriptor range.
fn raise(fd: &impl AsRawFd) -> Result<OwnedFd> {
    fd::duplicate_above(fd.as_raw_fd(), STAGING_FD)
}

/// Places each `(source, target)` pair with `dup2`, which clears
/// close-on-exec on the target. Async-signal-safe.
fn place(pairs: &[(RawFd, RawFd)]) -> std::io::Result<()> {
    for &(source, target) in pairs {
        // SAFETY: dup2 only touches the descriptor table of the child.
        if unsafe { libc::dup2(source, target) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Command running the starter as `stage` with the segment at fd 3.
pub fn stage_command(starter: &Path, stage: Stage) -> Command {
    let mut command = Command::new(starter);
    let _ = command
        .env(STAGE_ENV, stage.as_str())
        .env(SCONFIG_FD_ENV, SCONFIG_FD.to_string())
        .stdin(Stdio::null());
    command
}

fn with_descriptors(command: &mut Command, pairs: Vec<(RawFd, RawFd)>) {
    // SAFETY: the hook only calls dup2 on descriptors owned by the parent.
    let _ = unsafe { command.pre_exec(move || place(&pairs)) };
}

/// Starts one container.
pub struct Bootstrap {
    starter: PathBuf,
    config: EngineConfig,
    stdio: Option<(File, File)>,
}

impl Bootstrap {
    /// Bootstrap running `config` through the starter at `starter`.
    pub const fn new(starter: PathBuf, config: EngineConfig) -> Self {
        Self {
            starter,
            config,
            stdio: None,
        }
    }

    /// Sends the container's standard output and error to the given files.
    #[must_use]
    pub fn with_stdio(mut self, stdout: File, stderr: File) -> Self {
        self.stdio = Some((stdout, stderr));
        self
    }

    fn write_segment(&self) -> Result<File> {
        let bytes = shared_config::encode(&SegmentHeader::fixed(), &self.config.to_vec()?)?;
        let mut segment = memfd::create("cellar-sconfig")?;
        segment
            .write_all(&bytes)
            .map_err(|e| CellarError::io("memfd:cellar-sconfig", e))?;
        Ok(File::from(raise(&segment)?))
    }

    fn plan(&self, segment: RawFd) -> Result<CreatePlan> {
        let mut command = stage_command(&self.starter, Stage::Stage1);
        let _ = command.stdout(Stdio::piped()).stderr(Stdio::inherit());
        with_descriptors(&mut command, vec![(segment, SCONFIG_FD)]);
        let output = command
            .output()
            .map_err(|e| CellarError::io(&self.starter, e))?;
        if !output.status.success() {
            return Err(CellarError::config(format!(
                "stage1 rejected the configuration ({})",
                output.status
            )));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    fn spawn_rpc_server(&self, segment: RawFd, server: RawFd, plan: CreatePlan) -> Result<u32> {
        let mut command = stage_command(&self.starter, Stage::RpcServer);
        let _ = command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        let pairs = vec![(segment, SCONFIG_FD), (server, RPC_SERVER_FD)];
        let mount_ns = plan.namespaces.mount;
        // SAFETY: the hook only issues dup2, unshare and mount system calls.
        let _ = unsafe {
            command.pre_exec(move || {
                place(&pairs)?;
                if mount_ns {
                    nix::sched::unshare(CloneFlags::CLONE_NEWNS)?;
                    nix::mount::mount(
                        None::<&str>,
                        "/",
                        None::<&str>,
                        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                        None::<&str>,
                    )?;
                }
                Ok(())
            })
        };
        let child = command
            .spawn()
            .map_err(|e| CellarError::io(&self.starter, e))?;
        tracing::debug!(pid = child.id(), "rpc server started");
        Ok(child.id())
    }

    fn spawn_stage2(
        &mut self,
        pairs: Vec<(RawFd, RawFd)>,
        mount_ns: Option<RawFd>,
        plan: CreatePlan,
    ) -> Result<i32> {
        let mut command = stage_command(&self.starter, Stage::Stage2);
        match self.stdio.take() {
            Some((stdout, stderr)) => {
                let _ = command.stdout(stdout).stderr(stderr);
            }
            None => {
                let _ = command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
        }
        let unshared = plan.namespaces.container_flags();
        // SAFETY: the hook only issues dup2, setns and unshare system calls;
        // the namespace descriptor stays open in the parent until spawn returns.
        let _ = unsafe {
            command.pre_exec(move || {
                place(&pairs)?;
                if let Some(ns) = mount_ns {
                    nix::sched::setns(BorrowedFd::borrow_raw(ns), CloneFlags::CLONE_NEWNS)?;
                }
                if !unshared.is_empty() {
                    nix::sched::unshare(unshared)?;
                }
                Ok(())
            })
        };
        let child = command
            .spawn()
            .map_err(|e| CellarError::io(&self.starter, e))?;
        i32::try_from(child.id()).map_err(|_| CellarError::Protocol {
            message: format!("stage2 pid {} overflows i32", child.id()),
        })
    }

    /// Runs the pipeline; on success the process becomes the Master.
    ///
    /// # Errors
    ///
    /// Returns an error if Stage1 rejects the configuration, a stage cannot
    /// be spawned, or the final exec fails.
    pub fn run(mut self) -> Result<Infallible> {
        let segment = self.write_segment()?;
        let plan = self.plan(segment.as_raw_fd())?;
        tracing::debug!(?plan, engine = self.config.name(), "namespace plan received");

        let (client, server) = UnixStream::pair().map_err(|e| CellarError::io("socketpair", e))?;
        let (client, server) = (raise(&client)?, raise(&server)?);
        let (master, peer) = UnixStream::pair().map_err(|e| CellarError::io("socketpair", e))?;
        let (master, peer) = (raise(&master)?, raise(&peer)?);

        let rpc_pid = self.spawn_rpc_server(segment.as_raw_fd(), server.as_raw_fd(), plan)?;
        drop(server);

        let mount_ns = if plan.namespaces.mount {
            Some(File::from(raise(&namespace::open_mount_namespace(rpc_pid)?)?))
        } else {
            None
        };
        let pairs = vec![
            (segment.as_raw_fd(), SCONFIG_FD),
            (client.as_raw_fd(), RPC_CLIENT_FD),
            (peer.as_raw_fd(), MASTER_PEER_FD),
        ];
        let pid = self.spawn_stage2(pairs, mount_ns.as_ref().map(AsRawFd::as_raw_fd), plan)?;
        drop((client, peer, mount_ns));
        tracing::info!(container = pid, rpc_server = rpc_pid, "container stages started");

        segment
            .write_all_at(&pid.to_le_bytes(), PID_OFFSET)
            .map_err(|e| CellarError::io("memfd:cellar-sconfig", e))?;
        memfd::seal(&segment)?;

        let mut command = stage_command(&self.starter, Stage::Master);
        with_descriptors(
            &mut command,
            vec![(segment.as_raw_fd(), SCONFIG_FD), (master.as_raw_fd(), MASTER_FD)],
        );
        let error = command.exec();
        Err(CellarError::io(&self.starter, error))
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn configured_starter_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let starter = dir.path().join(STARTER_BIN);
        assert!(locate_starter(Some(&starter)).unwrap_err().is_not_found());

        std::fs::write(&starter, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&starter, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(locate_starter(Some(&starter)).unwrap(), starter);
    }

    #[test]
    fn stage_commands_select_their_stage() {
        let command = stage_command(Path::new("/usr/libexec/cellar-starter"), Stage::RpcServer);
        let envs: Vec<_> = command
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_str()?.to_string(), v?.to_str()?.to_string())))
            .collect();
        assert!(envs.contains(&(STAGE_ENV.to_string(), "rpc-server".to_string())));
        assert!(envs.contains(&(SCONFIG_FD_ENV.to_string(), "3".to_string())));
    }

    #[test]
    fn staged_descriptors_clear_the_fixed_range() {
        let segment = memfd::create("staging-test").unwrap();
        let staged = raise(&segment).unwrap();
        assert!(staged.as_raw_fd() >= STAGING_FD);
    }
}
