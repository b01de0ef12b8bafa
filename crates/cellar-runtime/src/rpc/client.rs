//! Calling side of the RPC channel.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use cellar_common::error::{CellarError, Result};
use cellar_core::loop_device::{LoopInfo, LoopMode};
use nix::mount::MsFlags;

use super::{Request, Response, read_frame, write_frame};

/// Synchronous client. Holds the only reference to its stream.
#[derive(Debug)]
pub struct RpcClient<S> {
    stream: S,
}

impl RpcClient<UnixStream> {
    /// Client over the inherited socket at `fd`.
    ///
    /// The descriptor is marked close-on-exec so the container process does
    /// not keep the channel alive.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor is not open.
    pub fn from_fd(fd: std::os::fd::RawFd) -> Result<Self> {
        let owned = cellar_core::fd::adopt(fd)?;
        cellar_core::fd::set_cloexec(fd, true)?;
        Ok(Self::new(UnixStream::from(owned)))
    }
}

impl<S: Read + Write> RpcClient<S> {
    /// Client over an already connected stream.
    pub const fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Sends `request` and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns a transport or protocol error; a handler error arrives inside
    /// the [`Response`].
    pub fn call(&mut self, request: &Request) -> Result<Response> {
        let body = serde_json::to_vec(request)?;
        write_frame(&mut self.stream, &body)?;
        let frame = read_frame(&mut self.stream)?.ok_or_else(|| CellarError::Protocol {
            message: format!("server closed the channel during {}", request.method()),
        })?;
        Ok(serde_json::from_slice(&frame)?)
    }

    fn invoke(&mut self, request: &Request) -> Result<i64> {
        tracing::debug!(method = request.method(), "rpc call");
        let response = self.call(request)?;
        match response.error {
            Some(message) => Err(CellarError::Rpc {
                method: request.method(),
                message,
            }),
            None => Ok(response.value),
        }
    }

    /// Creates `path` on the server side.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Rpc`] if the server could not create it.
    pub fn mkdir(&mut self, path: &Path, mode: u32) -> Result<()> {
        self.invoke(&Request::Mkdir {
            path: path.to_path_buf(),
            mode,
        })
        .map(drop)
    }

    /// Mounts on the server side.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Rpc`] if the mount failed.
    pub fn mount(
        &mut self,
        source: Option<&str>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        self.invoke(&Request::Mount {
            source: source.map(str::to_string),
            target: target.to_path_buf(),
            fstype: fstype.map(str::to_string),
            flags: u64::from(flags.bits()),
            data: data.map(str::to_string),
        })
        .map(drop)
    }

    /// Changes the server's root to `root`.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Rpc`] if `chroot(2)` failed.
    pub fn chroot(&mut self, root: &Path) -> Result<()> {
        self.invoke(&Request::Chroot {
            root: root.to_path_buf(),
        })
        .map(drop)
    }

    /// Attaches `image` and returns the loop device path.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Rpc`] if no device could be attached.
    pub fn loop_attach(&mut self, image: &Path, mode: LoopMode, info: LoopInfo) -> Result<PathBuf> {
        let value = self.invoke(&Request::LoopAttach {
            image: image.to_path_buf(),
            mode,
            info,
        })?;
        let number = u32::try_from(value).map_err(|_| CellarError::Protocol {
            message: format!("loop_attach returned invalid device number {value}"),
        })?;
        Ok(cellar_core::loop_device::device_path(number))
    }
}
