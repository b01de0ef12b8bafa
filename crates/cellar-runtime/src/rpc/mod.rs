//! Privileged-operation channel between the stages and the RPC server.
//!
//! Strictly request/response over a stream socket. Each message is a frame:
//! a 4-byte big-endian length followed by that many bytes of JSON. One call
//! is in flight at a time; the client's `&mut self` enforces it.

pub mod client;
pub mod server;

use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;

use cellar_common::error::{CellarError, Result};
use cellar_core::loop_device::{LoopInfo, LoopMode};
use serde::{Deserialize, Serialize};

pub use client::RpcClient;
pub use server::{RpcHandler, RpcServer, SyscallHandler};

/// Largest frame body either side accepts.
pub const MAX_FRAME: usize = 1 << 20;

/// A privileged operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum Request {
    /// Create a directory and its parents.
    Mkdir {
        /// Directory to create.
        path: PathBuf,
        /// Permission bits.
        mode: u32,
    },
    /// `mount(2)` with raw flags.
    Mount {
        /// Mount source, if the filesystem takes one.
        source: Option<String>,
        /// Mount point.
        target: PathBuf,
        /// Filesystem type.
        fstype: Option<String>,
        /// `MS_*` bits.
        flags: u64,
        /// Filesystem-specific data.
        data: Option<String>,
    },
    /// Change the server's root directory.
    Chroot {
        /// New root.
        root: PathBuf,
    },
    /// Attach an image file to a free loop device.
    LoopAttach {
        /// Image to attach.
        image: PathBuf,
        /// Open mode of the image.
        mode: LoopMode,
        /// Offset, size limit and flags.
        info: LoopInfo,
    },
}

impl Request {
    /// Method name, for logs and errors.
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Mkdir { .. } => "mkdir",
            Self::Mount { .. } => "mount",
            Self::Chroot { .. } => "chroot",
            Self::LoopAttach { .. } => "loop_attach",
        }
    }
}

/// Result of one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Method-specific return value; the device number for `LoopAttach`.
    pub value: i64,
    /// Error reported by the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// A successful response.
    pub const fn ok(value: i64) -> Self {
        Self { value, error: None }
    }

    /// A handler failure.
    pub fn failed(error: impl ToString) -> Self {
        Self {
            value: -1,
            error: Some(error.to_string()),
        }
    }
}

fn transport(e: std::io::Error) -> CellarError {
    CellarError::io("rpc-channel", e)
}

/// Writes one frame.
///
/// # Errors
///
/// Returns [`CellarError::Protocol`] for a body above [`MAX_FRAME`] and an
/// I/O error if the socket write fails.
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> Result<()> {
    if body.len() > MAX_FRAME {
        return Err(CellarError::Protocol {
            message: format!("frame of {} bytes exceeds {MAX_FRAME}", body.len()),
        });
    }
    let len = u32::try_from(body.len()).map_err(|_| CellarError::Protocol {
        message: "frame length overflows u32".into(),
    })?;
    writer.write_all(&len.to_be_bytes()).map_err(transport)?;
    writer.write_all(body).map_err(transport)?;
    writer.flush().map_err(transport)
}

/// Reads one frame; `None` means the peer closed at a frame boundary.
///
/// # Errors
///
/// Returns [`CellarError::Protocol`] if the stream ends inside a frame or
/// announces a body above [`MAX_FRAME`]. The stream is unusable afterwards.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(CellarError::Protocol {
                    message: format!("stream closed after {filled} header bytes"),
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(transport(e)),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME {
        return Err(CellarError::Protocol {
            message: format!("peer announced a {len} byte frame"),
        });
    }
    let mut body = vec![0; len];
    reader.read_exact(&mut body).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => CellarError::Protocol {
            message: format!("stream closed inside a {len} byte frame"),
        },
        _ => transport(e),
    })?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn frames_are_length_prefixed_big_endian() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"{}").unwrap();
        assert_eq!(wire, [0, 0, 0, 2, b'{', b'}']);
        let mut cursor = Cursor::new(wire);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"{}");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn partial_header_and_body_are_desync() {
        let mut cursor = Cursor::new(vec![0, 0]);
        assert!(matches!(read_frame(&mut cursor), Err(CellarError::Protocol { .. })));

        let mut cursor = Cursor::new(vec![0, 0, 0, 5, b'a']);
        assert!(matches!(read_frame(&mut cursor), Err(CellarError::Protocol { .. })));
    }

    #[test]
    fn oversized_frames_are_refused_both_ways() {
        let announced = u32::try_from(MAX_FRAME + 1).unwrap().to_be_bytes();
        let mut cursor = Cursor::new(announced.to_vec());
        assert!(matches!(read_frame(&mut cursor), Err(CellarError::Protocol { .. })));

        let body = vec![b' '; MAX_FRAME + 1];
        assert!(write_frame(&mut Vec::new(), &body).is_err());
    }

    #[test]
    fn requests_carry_method_tag() {
        let request = Request::Chroot { root: "/srv/root".into() };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["method"], "chroot");
        assert_eq!(json["args"]["root"], "/srv/root");
        assert_eq!(request.method(), "chroot");
    }
}
