//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default base directory for Cellar data on Linux with root access.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/cellar";

/// Returns the data directory, preferring `$CELLAR_DATA_DIR`, then
/// `$HOME/.cellar`, falling back to `/var/lib/cellar`.
fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CELLAR_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(home) = std::env::var("HOME") {
        let user_dir = PathBuf::from(home).join(".cellar");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Returns the default checkpoint root (`<data_dir>/checkpoint/criu`).
pub fn default_checkpoint_dir() -> PathBuf {
    data_dir().join("checkpoint").join("criu")
}

/// Returns the default path of the criu injection config.
pub fn default_criu_config() -> PathBuf {
    data_dir().join("criu-conf.yaml")
}

/// Fast volatile storage under which memory-backed checkpoints keep images.
pub const DEFAULT_TMPFS_DIR: &str = "/dev/shm";

/// In-container mount point of a checkpoint root.
pub const CONTAINER_STATE_PATH: &str = "/.checkpoint";

/// In-container mount point of a memory-backed image directory.
pub const CONTAINER_IMAGE_PATH: &str = "/.checkpoint/img";

/// Image subdirectory inside a checkpoint root.
pub const IMG_DIR: &str = "img";

/// Log subdirectory inside a checkpoint root.
pub const LOG_DIR: &str = "log";

/// Marker file inside `img/` holding the backing directory of a memory entry.
pub const REAL_PATH_MARKER: &str = "real_path";

/// Pid record of the checkpointed process.
pub const PID_FILE: &str = "cmd.pid";

/// Saved launch configuration inside a checkpoint root.
pub const CONFIG_FILE: &str = "config.json";

/// Suffix of rollback copies of log files.
pub const BACK_SUFFIX: &str = ".back";

/// Name of the checkpoint/restore engine binary.
pub const CRIU_BIN: &str = "criu";

/// Environment variable carrying the shared configuration descriptor.
pub const SCONFIG_FD_ENV: &str = "CELLAR_SCONFIG_FD";

/// Environment variable carrying the stage selector.
pub const STAGE_ENV: &str = "CELLAR_STAGE";

/// Descriptor number at which stages inherit the shared configuration.
pub const SCONFIG_FD: i32 = 3;

/// Descriptor number of the client end of the RPC socket pair.
pub const RPC_CLIENT_FD: i32 = 4;

/// Descriptor number of the server end of the RPC socket pair.
pub const RPC_SERVER_FD: i32 = 5;

/// Descriptor number of the master end of the master socket pair.
pub const MASTER_FD: i32 = 6;

/// Descriptor number of the stage 2 end of the master socket pair.
pub const MASTER_PEER_FD: i32 = 7;

/// Binary name of the per-stage starter.
pub const STARTER_BIN: &str = "cellar-starter";
