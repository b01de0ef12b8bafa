//! Mount utilities for container filesystem setup.
//!
//! Raw mounts, directory creation and root switching inside the container's
//! mount namespace.

use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use cellar_common::error::{CellarError, Result};
use nix::mount::{MsFlags, mount};

/// Mounts `source` on `target` with explicit flags and filesystem data.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
pub fn mount_raw(
    source: Option<&str>,
    target: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    mount(source, target, fstype, flags, data).map_err(|e| CellarError::PermissionDenied {
        message: format!("mount {source:?} on {} failed: {e}", target.display()),
    })?;
    tracing::debug!(?source, target = %target.display(), ?fstype, ?flags, "mounted");
    Ok(())
}

/// Creates `path` and any missing parents with the given mode.
///
/// # Errors
///
/// Returns an error if directory creation fails.
pub fn make_dir(path: &Path, mode: u32) -> Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .map_err(|e| CellarError::io(path, e))
}

/// Changes the root directory of the calling process and enters it.
///
/// # Errors
///
/// Returns an error if `chroot(2)` or `chdir(2)` fails.
pub fn change_root(root: &Path) -> Result<()> {
    nix::unistd::chroot(root).map_err(|e| CellarError::PermissionDenied {
        message: format!("chroot {} failed: {e}", root.display()),
    })?;
    nix::unistd::chdir("/").map_err(|e| CellarError::PermissionDenied {
        message: format!("chdir / after chroot failed: {e}"),
    })?;
    tracing::info!(root = %root.display(), "changed root");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_dir_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        make_dir(&nested, 0o755).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn make_dir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        make_dir(dir.path(), 0o755).unwrap();
    }
}
