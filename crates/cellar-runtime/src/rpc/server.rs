//! Serving side of the RPC channel.
//!
//! The server runs with elevated privilege inside the container's mount
//! namespace and performs the operations the other stages cannot. Handler
//! failures are answered, never fatal; only a desynchronized transport
//! stops the loop with an error.

use std::io::{Read, Write};
use std::path::Path;

use cellar_common::error::Result;
use cellar_core::filesystem::mount;
use cellar_core::loop_device::{self, LoopDevice, LoopInfo, LoopMode};
use nix::mount::MsFlags;

use super::{Request, Response, read_frame, write_frame};

/// Executes privileged operations on behalf of the stages.
pub trait RpcHandler: Send {
    /// Creates `path` and its parents.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    fn mkdir(&mut self, path: &Path, mode: u32) -> Result<i64>;

    /// Performs a `mount(2)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount fails.
    fn mount(
        &mut self,
        source: Option<&str>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<i64>;

    /// Changes the root directory.
    ///
    /// # Errors
    ///
    /// Returns an error if `chroot(2)` fails.
    fn chroot(&mut self, root: &Path) -> Result<i64>;

    /// Attaches `image` to a loop device, returning its number.
    ///
    /// # Errors
    ///
    /// Returns an error if no device can be attached.
    fn loop_attach(&mut self, image: &Path, mode: LoopMode, info: &LoopInfo) -> Result<i64>;
}

/// Handler backed by the real system calls.
///
/// Attached loop devices stay open until the handler is dropped, which is
/// after the client hung up and so after every mount it asked for.
#[derive(Debug, Default)]
pub struct SyscallHandler {
    attached: Vec<LoopDevice>,
}

impl SyscallHandler {
    /// Loop devices attached so far.
    pub fn attached(&self) -> &[LoopDevice] {
        &self.attached
    }
}

impl RpcHandler for SyscallHandler {
    fn mkdir(&mut self, path: &Path, mode: u32) -> Result<i64> {
        mount::make_dir(path, mode).map(|()| 0)
    }

    fn mount(
        &mut self,
        source: Option<&str>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<i64> {
        mount::mount_raw(source, target, fstype, flags, data).map(|()| 0)
    }

    fn chroot(&mut self, root: &Path) -> Result<i64> {
        mount::change_root(root).map(|()| 0)
    }

    fn loop_attach(&mut self, image: &Path, mode: LoopMode, info: &LoopInfo) -> Result<i64> {
        let device = loop_device::attach(image, mode, info)?;
        let number = i64::from(device.number());
        self.attached.push(device);
        Ok(number)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn ms_flags(raw: u64) -> MsFlags {
    MsFlags::from_bits_truncate(raw as libc::c_ulong)
}

/// Runs one request against `handler`.
pub fn handle(handler: &mut dyn RpcHandler, request: &Request) -> Response {
    let result = match request {
        Request::Mkdir { path, mode } => handler.mkdir(path, *mode),
        Request::Mount {
            source,
            target,
            fstype,
            flags,
            data,
        } => handler.mount(
            source.as_deref(),
            target,
            fstype.as_deref(),
            ms_flags(*flags),
            data.as_deref(),
        ),
        Request::Chroot { root } => handler.chroot(root),
        Request::LoopAttach { image, mode, info } => handler.loop_attach(image, *mode, info),
    };
    match result {
        Ok(value) => Response::ok(value),
        Err(e) => {
            tracing::warn!(method = request.method(), error = %e, "rpc call failed");
            Response::failed(e)
        }
    }
}

/// Request loop over one connected stream.
pub struct RpcServer<S> {
    stream: S,
    handler: Box<dyn RpcHandler>,
}

impl<S: Read + Write> RpcServer<S> {
    /// Serves `stream` with `handler`.
    pub fn new(stream: S, handler: Box<dyn RpcHandler>) -> Self {
        Self { stream, handler }
    }

    /// Serves requests until the client closes the channel.
    ///
    /// A body that is not a valid request is answered with an error; the
    /// frame boundary is intact, so the channel stays usable.
    ///
    /// # Errors
    ///
    /// Returns [`cellar_common::error::CellarError::Protocol`] on a
    /// truncated or oversized frame and an I/O error if a reply cannot be
    /// written.
    pub fn serve(mut self) -> Result<()> {
        let mut served = 0u64;
        while let Some(frame) = read_frame(&mut self.stream)? {
            let response = match serde_json::from_slice::<Request>(&frame) {
                Ok(request) => handle(self.handler.as_mut(), &request),
                Err(e) => Response::failed(format!("malformed request: {e}")),
            };
            write_frame(&mut self.stream, &serde_json::to_vec(&response)?)?;
            served += 1;
        }
        tracing::debug!(served, "rpc client closed the channel");
        Ok(())
    }
}
