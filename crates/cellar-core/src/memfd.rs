//! Anonymous shared memory segments that can be sealed against writes.
//!
//! The bootstrap writes the shared configuration into a memfd, applies
//! write/shrink/grow seals once it is done, and hands the descriptor to the
//! stage processes, which inherit the same segment rather than a copy.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd};

use cellar_common::error::{CellarError, Result};

const FULL_SEALS: libc::c_int =
    libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_WRITE | libc::F_SEAL_SEAL;

/// Creates an empty, sealable, close-on-exec memfd.
///
/// # Errors
///
/// Returns an error if the name contains a NUL byte or `memfd_create(2)`
/// fails.
pub fn create(name: &str) -> Result<File> {
    let cname = CString::new(name)
        .map_err(|_| CellarError::config(format!("memfd name contains NUL: {name:?}")))?;
    // SAFETY: `cname` is a valid NUL-terminated string for the duration of the call.
    let fd = unsafe {
        libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING)
    };
    if fd < 0 {
        return Err(CellarError::io(
            format!("memfd:{name}"),
            std::io::Error::last_os_error(),
        ));
    }
    // SAFETY: `fd` was just returned by memfd_create and is owned by nobody else.
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Seals the segment: no further writes, resizes, or seal changes.
///
/// # Errors
///
/// Returns an error if `fcntl(F_ADD_SEALS)` fails, for instance when a
/// writable mapping is still live.
pub fn seal(file: &File) -> Result<()> {
    // SAFETY: `file` owns an open descriptor; F_ADD_SEALS takes an int.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_ADD_SEALS, FULL_SEALS) };
    if rc < 0 {
        return Err(CellarError::io("memfd", std::io::Error::last_os_error()));
    }
    tracing::debug!(fd = file.as_raw_fd(), "segment sealed");
    Ok(())
}

/// Returns whether write sealing has been applied.
///
/// # Errors
///
/// Returns an error if `fcntl(F_GET_SEALS)` fails.
pub fn is_sealed(file: &File) -> Result<bool> {
    // SAFETY: `file` owns an open descriptor; F_GET_SEALS takes no argument.
    let seals = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GET_SEALS) };
    if seals < 0 {
        return Err(CellarError::io("memfd", std::io::Error::last_os_error()));
    }
    Ok(seals & libc::F_SEAL_WRITE != 0)
}
