//! The shared configuration segment handed to every stage.
//!
//! The bootstrap is the only writer. It fills a memfd with a fixed header
//! followed by the serialized engine configuration, patches in the
//! container pid once Stage2 exists, and seals the segment before the
//! Master starts. Stages inherit the descriptor at [`SCONFIG_FD`], so all of
//! them read the same bytes.
//!
//! Layout, little-endian:
//!
//! | offset | size | field                    |
//! |--------|------|--------------------------|
//! | 0      | 4    | magic `CLLR`             |
//! | 4      | 2    | version                  |
//! | 6      | 2    | reserved                 |
//! | 8      | 4    | container pid            |
//! | 12     | 8    | rpc socket pair          |
//! | 20     | 8    | master socket pair       |
//! | 28     | 4    | payload length           |
//! | 32     | n    | payload (engine config)  |

use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileExt;

use cellar_common::constants::{
    MASTER_FD, MASTER_PEER_FD, RPC_CLIENT_FD, RPC_SERVER_FD, SCONFIG_FD, SCONFIG_FD_ENV, STAGE_ENV,
};
use cellar_common::error::{CellarError, Result};
use cellar_common::types::Stage;

use crate::engine::EngineConfig;

/// Segment magic.
pub const MAGIC: [u8; 4] = *b"CLLR";
/// Current layout version.
pub const VERSION: u16 = 1;
/// Size of the fixed header.
pub const HEADER_LEN: usize = 32;
/// Offset of the container pid, patched after Stage2 is spawned.
pub const PID_OFFSET: u64 = 8;

/// Fixed fields preceding the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Host pid of Stage2, 0 until it is known.
    pub container_pid: i32,
    /// RPC channel: client end, server end.
    pub rpc_fds: [RawFd; 2],
    /// Status channel: master end, Stage2 end.
    pub master_fds: [RawFd; 2],
}

impl SegmentHeader {
    /// Header announcing the fixed descriptor numbers and no pid yet.
    pub const fn fixed() -> Self {
        Self {
            container_pid: 0,
            rpc_fds: [RPC_CLIENT_FD, RPC_SERVER_FD],
            master_fds: [MASTER_FD, MASTER_PEER_FD],
        }
    }
}

/// Serializes a segment.
///
/// # Errors
///
/// Returns a configuration error if the payload does not fit a `u32` length.
pub fn encode(header: &SegmentHeader, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| CellarError::config("engine configuration is too large for the segment"))?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&header.container_pid.to_le_bytes());
    for fd in header.rpc_fds.iter().chain(&header.master_fds) {
        out.extend_from_slice(&fd.to_le_bytes());
    }
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

fn corrupt(reason: impl Into<String>) -> CellarError {
    CellarError::Corrupt {
        path: "shared-config".into(),
        reason: reason.into(),
    }
}

fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    i32::from_le_bytes(raw)
}

/// A stage's view of the segment.
#[derive(Debug)]
pub struct SharedConfig {
    stage: Stage,
    header: SegmentHeader,
    payload: Vec<u8>,
    segment: Option<File>,
    released: bool,
}

impl SharedConfig {
    /// Parses a segment image for `stage`.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Corrupt`] for a bad magic, an unknown version,
    /// or a header or payload shorter than announced.
    pub fn parse(bytes: &[u8], stage: Stage) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(corrupt(format!(
                "segment is {} bytes, header needs {HEADER_LEN}",
                bytes.len()
            )));
        }
        if bytes[..4] != MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(corrupt(format!("unsupported layout version {version}")));
        }
        let header = SegmentHeader {
            container_pid: read_i32(bytes, 8),
            rpc_fds: [read_i32(bytes, 12), read_i32(bytes, 16)],
            master_fds: [read_i32(bytes, 20), read_i32(bytes, 24)],
        };
        let len = u32::from_le_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]) as usize;
        let payload = bytes
            .get(HEADER_LEN..HEADER_LEN + len)
            .ok_or_else(|| corrupt(format!("payload truncated, expected {len} bytes")))?;
        Ok(Self {
            stage,
            header,
            payload: payload.to_vec(),
            segment: None,
            released: false,
        })
    }

    /// Opens the inherited segment at `fd`, taking ownership of it.
    ///
    /// Reads are positional, so stages sharing the open file description do
    /// not disturb each other.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor is not open, cannot be read, or
    /// holds a corrupt segment.
    pub fn open(fd: RawFd, stage: Stage) -> Result<Self> {
        let file = File::from(cellar_core::fd::adopt(fd)?);
        let path = format!("fd:{fd}");
        let len = file.metadata().map_err(|e| CellarError::io(&path, e))?.len();
        let len = usize::try_from(len).map_err(|_| corrupt("segment size overflows usize"))?;
        let mut bytes = vec![0; len];
        file.read_exact_at(&mut bytes, 0)
            .map_err(|e| CellarError::io(&path, e))?;
        let mut config = Self::parse(&bytes, stage)?;
        config.segment = Some(file);
        tracing::debug!(%stage, fd, payload = config.payload.len(), "shared configuration opened");
        Ok(config)
    }

    /// Opens the segment described by `CELLAR_STAGE` and `CELLAR_SCONFIG_FD`.
    ///
    /// The descriptor defaults to 3 when the variable is unset.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a missing or unknown stage and any
    /// error from [`SharedConfig::open`].
    pub fn from_env() -> Result<Self> {
        let stage: Stage = std::env::var(STAGE_ENV)
            .map_err(|_| CellarError::config(format!("{STAGE_ENV} is not set")))?
            .parse()?;
        let fd = match std::env::var(SCONFIG_FD_ENV) {
            Ok(raw) => raw
                .parse()
                .map_err(|_| CellarError::config(format!("invalid {SCONFIG_FD_ENV}: {raw:?}")))?,
            Err(_) => SCONFIG_FD,
        };
        Self::open(fd, stage)
    }

    /// Stage this view was opened for.
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Serialized engine configuration.
    pub fn json_config(&self) -> &[u8] {
        &self.payload
    }

    /// Decodes the engine configuration payload.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload is not an engine config.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        EngineConfig::from_slice(&self.payload)
    }

    /// Host pid of the container process.
    ///
    /// The bootstrap patches the pid in after Stage1, the RPC server and
    /// Stage2 have read the segment, so only the Master sees it.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Protocol`] if no pid was recorded yet.
    pub fn container_pid(&self) -> Result<i32> {
        match self.header.container_pid {
            pid if pid > 0 => Ok(pid),
            _ => Err(CellarError::Protocol {
                message: format!("{} stage has no container pid yet", self.stage),
            }),
        }
    }

    /// RPC descriptors: client end, server end.
    pub const fn rpc_fds(&self) -> [RawFd; 2] {
        self.header.rpc_fds
    }

    /// Status descriptors: master end, Stage2 end.
    pub const fn master_fds(&self) -> [RawFd; 2] {
        self.header.master_fds
    }

    /// Whether [`SharedConfig::release`] already ran.
    pub const fn is_released(&self) -> bool {
        self.released
    }

    /// Closes the segment descriptor; the parsed view stays readable.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::AlreadyReleased`] on a second call.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Err(CellarError::AlreadyReleased);
        }
        self.released = true;
        if let Some(segment) = self.segment.take() {
            tracing::debug!(stage = %self.stage, fd = segment.as_raw_fd(), "shared configuration released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::IntoRawFd;

    use super::*;

    fn segment(payload: &[u8]) -> Vec<u8> {
        let header = SegmentHeader {
            container_pid: 4321,
            ..SegmentHeader::fixed()
        };
        encode(&header, payload).unwrap()
    }

    #[test]
    fn parse_exposes_payload_and_pid() {
        let bytes = segment(br#"{"engine":"native","payload":{}}"#);
        let config = SharedConfig::parse(&bytes, Stage::Master).unwrap();
        assert_eq!(config.stage(), Stage::Master);
        assert_eq!(config.container_pid().unwrap(), 4321);
        assert_eq!(config.rpc_fds(), [RPC_CLIENT_FD, RPC_SERVER_FD]);
        assert_eq!(config.master_fds(), [MASTER_FD, MASTER_PEER_FD]);
        assert_eq!(config.engine_config().unwrap().name(), "native");
    }

    #[test]
    fn unpatched_pid_is_refused() {
        let bytes = encode(&SegmentHeader::fixed(), b"{}").unwrap();
        let config = SharedConfig::parse(&bytes, Stage::Stage2).unwrap();
        assert!(matches!(config.container_pid(), Err(CellarError::Protocol { .. })));
    }

    #[test]
    fn second_release_is_distinguishable() {
        let mut config = SharedConfig::parse(&segment(b"{}"), Stage::Stage2).unwrap();
        config.release().unwrap();
        assert!(config.is_released());
        assert!(matches!(config.release(), Err(CellarError::AlreadyReleased)));
        assert_eq!(config.json_config(), b"{}");
    }

    #[test]
    fn truncated_segments_are_corrupt() {
        let bytes = segment(b"0123456789");
        for cut in [0, 4, HEADER_LEN - 1, HEADER_LEN + 3] {
            let err = SharedConfig::parse(&bytes[..cut], Stage::Stage1).unwrap_err();
            assert!(matches!(err, CellarError::Corrupt { .. }), "cut at {cut}: {err}");
        }
    }

    #[test]
    fn foreign_magic_and_version_are_rejected() {
        let mut bytes = segment(b"");
        bytes[0] = b'X';
        assert!(SharedConfig::parse(&bytes, Stage::Stage1).is_err());

        let mut bytes = segment(b"");
        bytes[4] = 9;
        assert!(SharedConfig::parse(&bytes, Stage::Stage1).is_err());
    }

    #[test]
    fn open_reads_a_sealed_memfd() {
        let mut file = cellar_core::memfd::create("sconfig-test").unwrap();
        file.write_all(&segment(b"payload")).unwrap();
        file.write_at(&77i32.to_le_bytes(), PID_OFFSET).unwrap();
        cellar_core::memfd::seal(&file).unwrap();

        let mut config = SharedConfig::open(file.into_raw_fd(), Stage::RpcServer).unwrap();
        assert_eq!(config.container_pid().unwrap(), 77);
        assert_eq!(config.json_config(), b"payload");
        config.release().unwrap();
    }
}
