//! Linux namespace management for container isolation.
//!
//! The namespace plan produced by an engine's `create` hook, the handle
//! Stage2 joins the RPC server's mount namespace through, and `sethostname(2)`.

use std::fs::File;

use cellar_common::error::{CellarError, Result};
use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

/// Configuration for which namespaces to create or join.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Isolate PID namespace.
    pub pid: bool,
    /// Isolate mount namespace.
    pub mount: bool,
    /// Isolate network namespace.
    pub network: bool,
    /// Isolate IPC namespace.
    pub ipc: bool,
    /// Isolate UTS (hostname) namespace.
    pub uts: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            pid: true,
            mount: true,
            network: false,
            ipc: true,
            uts: true,
        }
    }
}

impl NamespaceConfig {
    /// A plan that isolates nothing.
    pub const fn none() -> Self {
        Self {
            pid: false,
            mount: false,
            network: false,
            ipc: false,
            uts: false,
        }
    }

    /// Returns the `CLONE_NEW*` flags for every requested namespace.
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        flags.set(CloneFlags::CLONE_NEWPID, self.pid);
        flags.set(CloneFlags::CLONE_NEWNS, self.mount);
        flags.set(CloneFlags::CLONE_NEWNET, self.network);
        flags.set(CloneFlags::CLONE_NEWIPC, self.ipc);
        flags.set(CloneFlags::CLONE_NEWUTS, self.uts);
        flags
    }

    /// Flags unshared by the container process itself; the mount namespace
    /// is owned by the RPC server and joined instead.
    pub fn container_flags(&self) -> CloneFlags {
        self.clone_flags().difference(CloneFlags::CLONE_NEWNS)
    }
}

/// Opens the mount namespace handle of a running process.
///
/// # Errors
///
/// Returns an error if `/proc/<pid>/ns/mnt` cannot be opened.
pub fn open_mount_namespace(pid: u32) -> Result<File> {
    let path = format!("/proc/{pid}/ns/mnt");
    File::open(&path).map_err(|e| CellarError::io(path, e))
}

/// Sets the hostname inside the UTS namespace.
///
/// # Errors
///
/// Returns an error if `sethostname(2)` fails.
pub fn set_hostname(hostname: &str) -> Result<()> {
    nix::unistd::sethostname(hostname).map_err(|e| CellarError::PermissionDenied {
        message: format!("sethostname {hostname} failed: {e}"),
    })?;
    tracing::debug!(hostname, "container hostname set");
    Ok(())
}
