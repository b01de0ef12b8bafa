//! Loop device attachment for image-file root filesystems.
//!
//! Finds a free device through `/dev/loop-control`, binds the image file to
//! it and applies the requested offset, size limit and flags.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use cellar_common::error::{CellarError, Result};
use serde::{Deserialize, Serialize};

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

/// Device is read-only.
pub const LO_FLAGS_READ_ONLY: u32 = 1;
/// Device detaches automatically once its last user closes it.
pub const LO_FLAGS_AUTOCLEAR: u32 = 4;

const ATTACH_ATTEMPTS: usize = 8;

/// Open mode of the backing image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    /// Attach read-only.
    ReadOnly,
    /// Attach read-write.
    ReadWrite,
}

/// Wire-friendly subset of `struct loop_info64`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopInfo {
    /// Byte offset of the filesystem inside the image.
    pub offset: u64,
    /// Maximum size exposed by the device, 0 for the whole file.
    pub size_limit: u64,
    /// `LO_FLAGS_*` bits.
    pub flags: u32,
}

#[repr(C)]
struct RawLoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; 64],
    lo_crypt_name: [u8; 64],
    lo_encrypt_key: [u8; 32],
    lo_init: [u64; 2],
}

impl RawLoopInfo64 {
    fn new(info: &LoopInfo, image: &Path) -> Self {
        let mut file_name = [0u8; 64];
        let bytes = image.as_os_str().as_encoded_bytes();
        let len = bytes.len().min(file_name.len() - 1);
        file_name[..len].copy_from_slice(&bytes[..len]);
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: info.offset,
            lo_sizelimit: info.size_limit,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: info.flags,
            lo_file_name: file_name,
            lo_crypt_name: [0; 64],
            lo_encrypt_key: [0; 32],
            lo_init: [0; 2],
        }
    }
}

/// Returns the device node of loop device `number`.
pub fn device_path(number: u32) -> PathBuf {
    PathBuf::from(format!("/dev/loop{number}"))
}

/// An attached loop device, held open.
///
/// With [`LO_FLAGS_AUTOCLEAR`] the kernel detaches the device when its last
/// user goes away, so the handle must outlive the mount that uses it.
#[derive(Debug)]
pub struct LoopDevice {
    number: u32,
    file: File,
}

impl LoopDevice {
    /// Device number.
    pub const fn number(&self) -> u32 {
        self.number
    }

    /// Device node path.
    pub fn path(&self) -> PathBuf {
        device_path(self.number)
    }

    /// The open device node.
    pub const fn file(&self) -> &File {
        &self.file
    }
}

/// Attaches `image` to a free loop device.
///
/// A device grabbed by a concurrent attacher between `LOOP_CTL_GET_FREE`
/// and `LOOP_SET_FD` reports `EBUSY`; such attempts are retried.
///
/// # Errors
///
/// Returns an error if the image or control device cannot be opened or every
/// attach attempt fails.
pub fn attach(image: &Path, mode: LoopMode, info: &LoopInfo) -> Result<LoopDevice> {
    let writable = mode == LoopMode::ReadWrite;
    let backing = OpenOptions::new()
        .read(true)
        .write(writable)
        .open(image)
        .map_err(|e| CellarError::io(image, e))?;
    let control = File::open("/dev/loop-control")
        .map_err(|e| CellarError::io("/dev/loop-control", e))?;

    let mut info = *info;
    if !writable {
        info.flags |= LO_FLAGS_READ_ONLY;
    }
    let raw_info = RawLoopInfo64::new(&info, image);

    for attempt in 0..ATTACH_ATTEMPTS {
        // SAFETY: `control` is an open descriptor of /dev/loop-control and
        // LOOP_CTL_GET_FREE takes no argument.
        let free = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE as _) };
        if free < 0 {
            return Err(CellarError::io(
                "/dev/loop-control",
                std::io::Error::last_os_error(),
            ));
        }
        let number = free.unsigned_abs();
        let path = device_path(number);
        let device = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)
            .map_err(|e| CellarError::io(&path, e))?;

        // SAFETY: both descriptors are open for the duration of the call;
        // LOOP_SET_FD takes the backing descriptor by value.
        let rc = unsafe {
            libc::ioctl(device.as_raw_fd(), LOOP_SET_FD as _, backing.as_raw_fd())
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EBUSY) {
                tracing::debug!(number, attempt, "loop device taken, retrying");
                continue;
            }
            return Err(CellarError::io(&path, err));
        }

        // SAFETY: `raw_info` is a fully initialised loop_info64 that outlives
        // the call.
        let rc = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                LOOP_SET_STATUS64 as _,
                std::ptr::from_ref(&raw_info),
            )
        };
        if rc < 0 {
            return Err(CellarError::io(&path, std::io::Error::last_os_error()));
        }

        tracing::info!(image = %image.display(), number, ?mode, "loop device attached");
        return Ok(LoopDevice { number, file: device });
    }

    Err(CellarError::PermissionDenied {
        message: format!(
            "no free loop device for {} after {ATTACH_ATTEMPTS} attempts",
            image.display()
        ),
    })
}
