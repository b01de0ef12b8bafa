//! Descriptor plumbing between stage processes.
//!
//! Stages receive their sockets and the shared segment at fixed descriptor
//! numbers; the helpers here adopt and re-flag them. criu also refuses to
//! dump a tree holding descriptors to files it cannot see from inside the
//! container, so file descriptors inherited at startup are closed before a
//! checkpointable launch.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use cellar_common::error::{CellarError, Result};

/// One open descriptor of the current process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenDescriptor {
    /// Descriptor number.
    pub fd: RawFd,
    /// Link target under `/proc/self/fd`.
    pub target: PathBuf,
}

/// Lists the descriptors of the current process.
///
/// The descriptor used to read `/proc/self/fd` itself is excluded.
///
/// # Errors
///
/// Returns an error if `/proc/self/fd` cannot be read.
pub fn open_descriptors() -> Result<Vec<OpenDescriptor>> {
    let dir = std::fs::read_dir("/proc/self/fd").map_err(|e| CellarError::io("/proc/self/fd", e))?;
    let mut fds = Vec::new();
    for entry in dir.flatten() {
        let Some(fd) = entry.file_name().to_str().and_then(|n| n.parse::<RawFd>().ok()) else {
            continue;
        };
        let Ok(target) = std::fs::read_link(entry.path()) else {
            continue;
        };
        // The directory stream's own descriptor, closed once iteration ends.
        if target.starts_with("/proc") && target.ends_with("fd") {
            continue;
        }
        fds.push(OpenDescriptor { fd, target });
    }
    Ok(fds)
}

/// Descriptors the process was started with.
///
/// Capture this before the process opens anything itself: only descriptors
/// in the snapshot are ever closed, so nothing owned by Rust code is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InheritedDescriptors {
    descriptors: Vec<OpenDescriptor>,
}

impl InheritedDescriptors {
    /// Snapshots the current descriptor table.
    ///
    /// # Errors
    ///
    /// Returns an error if `/proc/self/fd` cannot be read.
    pub fn capture() -> Result<Self> {
        Ok(Self {
            descriptors: open_descriptors()?,
        })
    }

    /// The captured descriptors.
    pub fn descriptors(&self) -> &[OpenDescriptor] {
        &self.descriptors
    }

    /// Closes inherited descriptors above stderr that point at absolute
    /// filesystem paths.
    ///
    /// Sockets, pipes and anonymous inodes stay open, as does anything listed
    /// in `keep` and any number that no longer points at its captured
    /// target. Returns the closed descriptors.
    pub fn close_files(&self, keep: &[RawFd]) -> Vec<OpenDescriptor> {
        let mut closed = Vec::new();
        for desc in &self.descriptors {
            if desc.fd <= 2 || keep.contains(&desc.fd) || !desc.target.is_absolute() {
                continue;
            }
            let current = std::fs::read_link(format!("/proc/self/fd/{}", desc.fd));
            if current.as_ref().ok() != Some(&desc.target) {
                continue;
            }
            // SAFETY: the descriptor was inherited, still points at the
            // captured target, and has no owner in this process.
            if unsafe { libc::close(desc.fd) } != 0 {
                tracing::warn!(
                    fd = desc.fd,
                    target = %desc.target.display(),
                    error = %std::io::Error::last_os_error(),
                    "closing inherited descriptor failed"
                );
                continue;
            }
            tracing::debug!(fd = desc.fd, target = %desc.target.display(), "closed inherited descriptor");
            closed.push(desc.clone());
        }
        closed
    }
}

fn flags(fd: RawFd) -> Result<libc::c_int> {
    // SAFETY: F_GETFD only inspects the descriptor table.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(CellarError::io(format!("fd:{fd}"), std::io::Error::last_os_error()));
    }
    Ok(flags)
}

/// Takes ownership of an inherited descriptor.
///
/// # Errors
///
/// Returns an error if `fd` is not open in this process.
pub fn adopt(fd: RawFd) -> Result<OwnedFd> {
    let _ = flags(fd)?;
    // SAFETY: the descriptor is open and, by contract with the parent that
    // placed it at this number, owned by nothing else in this process.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Sets or clears `FD_CLOEXEC` on `fd`.
///
/// # Errors
///
/// Returns an error if either `fcntl(2)` call fails.
pub fn set_cloexec(fd: RawFd, enabled: bool) -> Result<()> {
    let current = flags(fd)?;
    let wanted = if enabled {
        current | libc::FD_CLOEXEC
    } else {
        current & !libc::FD_CLOEXEC
    };
    // SAFETY: F_SETFD only updates the descriptor flags.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, wanted) } < 0 {
        return Err(CellarError::io(format!("fd:{fd}"), std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Duplicates `fd` to the lowest free number at or above `min`, close-on-exec.
///
/// # Errors
///
/// Returns an error if `fcntl(F_DUPFD_CLOEXEC)` fails.
pub fn duplicate_above(fd: RawFd, min: RawFd) -> Result<OwnedFd> {
    // SAFETY: F_DUPFD_CLOEXEC returns a new descriptor or -1.
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, min) };
    if dup < 0 {
        return Err(CellarError::io(format!("fd:{fd}"), std::io::Error::last_os_error()));
    }
    // SAFETY: `dup` was just created and has no other owner.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

#[cfg(test)]
mod tests {
    use std::os::fd::{AsRawFd, IntoRawFd};

    use super::*;

    #[test]
    fn open_descriptors_sees_a_fresh_file() {
        let file = tempfile::tempfile().unwrap();
        let fds = open_descriptors().unwrap();
        assert!(fds.iter().any(|d| d.fd == file.as_raw_fd()));
        assert!(fds.iter().all(|d| !d.target.ends_with("fd")));
    }

    #[test]
    fn only_captured_files_are_closed() {
        let raw = tempfile::tempfile().unwrap().into_raw_fd();
        let target = std::fs::read_link(format!("/proc/self/fd/{raw}")).unwrap();
        let owned = tempfile::tempfile().unwrap();
        let inherited = InheritedDescriptors {
            descriptors: vec![
                OpenDescriptor { fd: raw, target },
                OpenDescriptor {
                    fd: owned.as_raw_fd(),
                    target: PathBuf::from("/var/log/replaced.log"),
                },
            ],
        };

        let closed = inherited.close_files(&[]);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].fd, raw);
        assert!(flags(owned.as_raw_fd()).is_ok());
    }

    #[test]
    fn kept_descriptors_stay_open() {
        let file = tempfile::tempfile().unwrap();
        let target = std::fs::read_link(format!("/proc/self/fd/{}", file.as_raw_fd())).unwrap();
        let inherited = InheritedDescriptors {
            descriptors: vec![OpenDescriptor { fd: file.as_raw_fd(), target }],
        };
        assert!(inherited.close_files(&[file.as_raw_fd()]).is_empty());
        assert!(flags(file.as_raw_fd()).is_ok());
    }

    #[test]
    fn duplicate_lands_above_minimum_and_closes_on_exec() {
        let file = tempfile::tempfile().unwrap();
        let dup = duplicate_above(file.as_raw_fd(), 100).unwrap();
        assert!(dup.as_raw_fd() >= 100);
        assert_ne!(flags(dup.as_raw_fd()).unwrap() & libc::FD_CLOEXEC, 0);

        set_cloexec(dup.as_raw_fd(), false).unwrap();
        assert_eq!(flags(dup.as_raw_fd()).unwrap() & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn adopting_a_closed_descriptor_fails() {
        assert!(adopt(-1).is_err());
    }
}
