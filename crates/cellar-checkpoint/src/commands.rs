//! Argument vectors for the external criu engine.
//!
//! Every builder is a pure function: it pins the image and work directories
//! to the checkpoint's paths and sends criu's own log into the work
//! directory.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use cellar_common::constants::{CONTAINER_IMAGE_PATH, CONTAINER_STATE_PATH, CRIU_BIN};
use cellar_common::error::CellarError;

/// Log file of a dump, relative to the work directory.
pub const DUMP_LOG: &str = "dump.log";
/// Log file of a restore, relative to the work directory.
pub const RESTORE_LOG: &str = "restore.log";
/// Log file of a page server, relative to the work directory.
pub const PAGE_SERVER_LOG: &str = "page-server.log";

/// Image and work directories handed to criu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    /// Directory holding the image files.
    pub images_dir: PathBuf,
    /// Directory for criu's scratch files and logs.
    pub work_dir: PathBuf,
}

impl CheckpointPaths {
    /// The paths as seen from inside a container with the checkpoint binds.
    pub fn container() -> Self {
        Self {
            images_dir: PathBuf::from(CONTAINER_IMAGE_PATH),
            work_dir: PathBuf::from(CONTAINER_STATE_PATH),
        }
    }
}

/// Remote endpoint receiving memory pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageServer {
    /// Host name or address.
    pub address: String,
    /// TCP port.
    pub port: u16,
}

impl fmt::Display for PageServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Parses `address:port`; the port follows the last colon.
impl FromStr for PageServer {
    type Err = CellarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, port) = s
            .rsplit_once(':')
            .ok_or_else(|| CellarError::config(format!("page server needs address:port, got {s:?}")))?;
        let address = address.trim_start_matches('[').trim_end_matches(']');
        if address.is_empty() {
            return Err(CellarError::config(format!("page server address is empty in {s:?}")));
        }
        let port = port
            .parse()
            .map_err(|_| CellarError::config(format!("invalid page server port in {s:?}")))?;
        Ok(Self {
            address: address.to_string(),
            port,
        })
    }
}

struct Argv(Vec<String>);

impl Argv {
    fn new(action: &str, privileged: bool) -> Self {
        let mut argv = vec![CRIU_BIN.to_string(), action.to_string()];
        if !privileged {
            argv.push("--unprivileged".into());
        }
        Self(argv)
    }

    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.0.push(arg.into());
        self
    }

    fn dirs(self, paths: &CheckpointPaths) -> Self {
        self.arg("--images-dir")
            .arg(paths.images_dir.to_string_lossy())
            .arg("--work-dir")
            .arg(paths.work_dir.to_string_lossy())
    }

    fn common(self, log_file: &str) -> Self {
        self.arg("--shell-job").arg("-v4").arg("--log-file").arg(log_file)
    }

    fn endpoint(self, server: &PageServer) -> Self {
        self.arg("--address")
            .arg(&server.address)
            .arg("--port")
            .arg(server.port.to_string())
    }
}

/// `criu dump` of the process tree rooted at `pid`.
///
/// With a page server, pages stream to the remote host instead of the local
/// image directory.
pub fn checkpoint_args(
    paths: &CheckpointPaths,
    pid: i32,
    privileged: bool,
    page_server: Option<&PageServer>,
) -> Vec<String> {
    let argv = Argv::new("dump", privileged)
        .arg("--tree")
        .arg(pid.to_string())
        .dirs(paths)
        .common(DUMP_LOG);
    match page_server {
        Some(server) => argv.arg("--page-server").endpoint(server).0,
        None => argv.0,
    }
}

/// `criu restore` from the checkpoint images.
pub fn restore_args(paths: &CheckpointPaths, privileged: bool) -> Vec<String> {
    Argv::new("restore", privileged).dirs(paths).common(RESTORE_LOG).0
}

/// `criu page-server` listening on `server`, writing into the images dir.
pub fn page_server_args(paths: &CheckpointPaths, privileged: bool, server: &PageServer) -> Vec<String> {
    Argv::new("page-server", privileged)
        .dirs(paths)
        .common(PAGE_SERVER_LOG)
        .endpoint(server)
        .0
}
