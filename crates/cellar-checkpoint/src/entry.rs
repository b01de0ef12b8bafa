//! A single checkpoint directory and the state derived from it.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use cellar_common::constants::{
    BACK_SUFFIX, CONFIG_FILE, CONTAINER_IMAGE_PATH, CONTAINER_STATE_PATH, IMG_DIR, LOG_DIR,
    PID_FILE, REAL_PATH_MARKER,
};
use cellar_common::error::{CellarError, Result};
use cellar_common::types::BindPath;
use serde::{Deserialize, Serialize};

use crate::commands::CheckpointPaths;

/// Where a checkpoint keeps its image files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    /// Images live in the entry's own `img/` directory.
    Disk,
    /// Images live in a backing directory on volatile storage.
    Memory,
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disk => write!(f, "disk"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for CheckpointKind {
    type Err = CellarError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disk" => Ok(Self::Disk),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(CellarError::config(format!("unknown checkpoint kind: {other}"))),
        }
    }
}

/// Which run a pair of log files belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// A normal, checkpointable launch.
    Launch,
    /// A run restored from a checkpoint.
    Restore,
}

impl RunKind {
    const fn infix(self) -> &'static str {
        match self {
            Self::Launch => "",
            Self::Restore => ".restore",
        }
    }
}

/// Standard stream log files of one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    /// Captured standard output.
    pub stdout: PathBuf,
    /// Captured standard error.
    pub stderr: PathBuf,
}

/// An existing checkpoint directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    path: PathBuf,
    kind: CheckpointKind,
    tmpfs: PathBuf,
}

impl CheckpointEntry {
    /// Opens the entry rooted at `path`, classifying its kind from disk.
    ///
    /// `tmpfs` is the memory image root the entry was created under; a
    /// marker naming any other backing directory is rejected on use.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Corrupt`] if the image directory is missing or
    /// the marker is not a regular file, and an I/O error if the marker
    /// cannot be inspected.
    pub fn open(path: impl Into<PathBuf>, tmpfs: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let kind = classify(&path.join(IMG_DIR))?;
        Ok(Self {
            path,
            kind,
            tmpfs: tmpfs.into(),
        })
    }

    /// Checkpoint root directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Checkpoint name: the last component of the root.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Kind derived when the entry was opened.
    pub const fn kind(&self) -> CheckpointKind {
        self.kind
    }

    /// Memory image root backing directories must live under.
    pub fn tmpfs(&self) -> &Path {
        &self.tmpfs
    }

    /// Path of the saved launch configuration.
    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }

    /// The entry's own `img/` directory.
    pub fn image_dir(&self) -> PathBuf {
        self.path.join(IMG_DIR)
    }

    fn log_dir(&self) -> PathBuf {
        self.path.join(LOG_DIR)
    }

    /// Last modification time of the checkpoint root.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be inspected.
    pub fn modified(&self) -> Result<chrono::DateTime<chrono::Local>> {
        let meta = std::fs::metadata(&self.path).map_err(|e| CellarError::io(&self.path, e))?;
        let mtime = meta.modified().map_err(|e| CellarError::io(&self.path, e))?;
        Ok(mtime.into())
    }

    /// Resolves the backing directory of a memory entry.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for disk entries, an error if the
    /// marker cannot be read, and [`CellarError::Corrupt`] if it names a
    /// directory other than the entry's own backing directory.
    pub fn backing_dir(&self) -> Result<PathBuf> {
        if self.kind == CheckpointKind::Disk {
            return Err(CellarError::config(format!(
                "checkpoint {} is disk backed and has no backing directory",
                self.name()
            )));
        }
        let marker = self.image_dir().join(REAL_PATH_MARKER);
        let recorded = read_real_path(&marker)?;
        verify_backing(&marker, recorded, &self.path, &self.tmpfs)
    }

    /// Host-side image and work directories, for running criu on the host.
    ///
    /// # Errors
    ///
    /// Returns an error if a memory entry's marker cannot be read.
    pub fn host_paths(&self) -> Result<CheckpointPaths> {
        let images_dir = match self.kind {
            CheckpointKind::Disk => self.image_dir(),
            CheckpointKind::Memory => self.backing_dir()?,
        };
        Ok(CheckpointPaths {
            images_dir,
            work_dir: self.path.clone(),
        })
    }

    /// Binds this checkpoint contributes to the container.
    ///
    /// Every entry binds its root at `/.checkpoint`; memory entries also bind
    /// their backing directory over `/.checkpoint/img`.
    ///
    /// # Errors
    ///
    /// Returns an error if a memory entry's marker cannot be read.
    pub fn bind_paths(&self) -> Result<Vec<BindPath>> {
        let mut binds = vec![BindPath::read_write(&self.path, CONTAINER_STATE_PATH)];
        if self.kind == CheckpointKind::Memory {
            binds.push(BindPath::read_write(self.backing_dir()?, CONTAINER_IMAGE_PATH));
        }
        Ok(binds)
    }

    /// Recreates a memory entry's backing directory if it was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be read or the directory cannot
    /// be created.
    pub fn sync(&self) -> Result<()> {
        if self.kind != CheckpointKind::Memory {
            return Ok(());
        }
        let backing = self.backing_dir()?;
        if !backing.exists() {
            create_private_dir(&backing)?;
            tracing::info!(
                checkpoint = %self.name(),
                backing = %backing.display(),
                "recreated missing backing directory"
            );
        }
        Ok(())
    }

    /// Reads the pid of the checkpointed process from `cmd.pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, its first line is empty, or
    /// the line is not a pid.
    pub fn pid(&self) -> Result<i32> {
        let path = self.path.join(PID_FILE);
        let file = File::open(&path).map_err(|e| CellarError::io(&path, e))?;
        let mut line = String::new();
        let _ = BufReader::new(file)
            .read_line(&mut line)
            .map_err(|e| CellarError::io(&path, e))?;
        let line = line.trim();
        if line.is_empty() {
            return Err(CellarError::Corrupt {
                path,
                reason: "pid record is empty".into(),
            });
        }
        line.parse().map_err(|_| CellarError::Corrupt {
            path,
            reason: format!("pid record is not a pid: {line:?}"),
        })
    }

    /// Records the pid of the checkpointable process.
    ///
    /// # Errors
    ///
    /// Returns an error if `cmd.pid` cannot be written.
    pub fn write_pid(&self, pid: i32) -> Result<()> {
        let path = self.path.join(PID_FILE);
        std::fs::write(&path, format!("{pid}\n")).map_err(|e| CellarError::io(&path, e))
    }

    /// Log file paths of process `name` for the given run.
    pub fn log_paths(&self, name: &str, run: RunKind) -> LogPaths {
        let dir = self.log_dir();
        let stem = format!("{name}{}", run.infix());
        LogPaths {
            stdout: dir.join(format!("{stem}.out")),
            stderr: dir.join(format!("{stem}.err")),
        }
    }

    /// Opens (creating if needed) the append-only log pair of `name`.
    ///
    /// Files are opened without following symlinks, mode 0644, and handed to
    /// `owner` when it differs from the caller or is root.
    ///
    /// # Errors
    ///
    /// Returns an error if the log directory or files cannot be created or
    /// re-owned.
    pub fn open_log_files(&self, name: &str, run: RunKind, owner: u32) -> Result<(File, File)> {
        create_private_dir(&self.log_dir())?;
        let paths = self.log_paths(name, run);
        let stdout = open_append(&paths.stdout, owner)?;
        let stderr = open_append(&paths.stderr, owner)?;
        tracing::debug!(
            checkpoint = %self.name(),
            stdout = %paths.stdout.display(),
            stderr = %paths.stderr.display(),
            "log files opened"
        );
        Ok((stdout, stderr))
    }

    /// Copies the current launch logs of `name` to their `.back` files.
    ///
    /// Failures are logged and never abort the new run.
    pub fn rollback_log_files(&self, name: &str) {
        let paths = self.log_paths(name, RunKind::Launch);
        for current in [paths.stderr, paths.stdout] {
            let mut back = current.clone().into_os_string();
            back.push(BACK_SUFFIX);
            if let Err(e) = std::fs::copy(&current, &back) {
                tracing::warn!(
                    from = %current.display(),
                    to = %PathBuf::from(&back).display(),
                    error = %e,
                    "log rollback copy failed"
                );
            }
        }
    }
}

fn open_append(path: &Path, owner: u32) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .mode(0o644)
        .custom_flags(nix::libc::O_NOFOLLOW)
        .open(path)
        .map_err(|e| CellarError::io(path, e))?;
    // The creation mode is filtered by the umask; pin it explicitly.
    file.set_permissions(std::fs::Permissions::from_mode(0o644))
        .map_err(|e| CellarError::io(path, e))?;
    let uid = nix::unistd::getuid().as_raw();
    if owner != uid || owner == 0 {
        let gid = nix::unistd::getgid().as_raw();
        std::os::unix::fs::fchown(&file, Some(owner), Some(gid))
            .map_err(|e| CellarError::io(path, e))?;
    }
    Ok(file)
}

/// Kind of the image directory `img`: a non-empty marker means memory.
pub(crate) fn classify(img: &Path) -> Result<CheckpointKind> {
    if !img.is_dir() {
        return Err(CellarError::Corrupt {
            path: img.to_path_buf(),
            reason: "image directory is missing".into(),
        });
    }
    let marker = img.join(REAL_PATH_MARKER);
    match std::fs::symlink_metadata(&marker) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CheckpointKind::Disk),
        Err(e) => Err(CellarError::io(marker, e)),
        Ok(meta) if !meta.is_file() => Err(CellarError::Corrupt {
            path: marker,
            reason: "marker is not a regular file".into(),
        }),
        Ok(meta) if meta.len() == 0 => Ok(CheckpointKind::Disk),
        Ok(_) => Ok(CheckpointKind::Memory),
    }
}

/// Creates `img` under `root` in the requested kind.
///
/// For memory entries the backing directory is `<tmpfs>/<root>` and its path
/// is written into the marker.
pub(crate) fn create_image_dir(root: &Path, kind: CheckpointKind, tmpfs: &Path) -> Result<()> {
    let img = root.join(IMG_DIR);
    std::fs::DirBuilder::new()
        .mode(0o700)
        .create(&img)
        .map_err(|e| CellarError::io(&img, e))?;
    if kind == CheckpointKind::Disk {
        return Ok(());
    }
    let backing = backing_dir_for(root, tmpfs);
    let marker = img.join(REAL_PATH_MARKER);
    std::fs::write(&marker, backing.as_os_str().as_encoded_bytes())
        .map_err(|e| CellarError::io(&marker, e))?;
    create_private_dir(&backing)?;
    tracing::debug!(root = %root.display(), backing = %backing.display(), "memory image directory created");
    Ok(())
}

/// Removes the backing directory of the entry at `root`, if it has one.
///
/// A marker naming anything but `<tmpfs>/<root>` is left alone and reported
/// as [`CellarError::Corrupt`].
pub(crate) fn remove_backing_dir(root: &Path, tmpfs: &Path) -> Result<()> {
    let marker = root.join(IMG_DIR).join(REAL_PATH_MARKER);
    let recorded = match read_real_path(&marker) {
        Ok(path) => path,
        Err(CellarError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    if recorded.as_os_str().is_empty() {
        return Ok(());
    }
    let backing = verify_backing(&marker, recorded, root, tmpfs)?;
    match std::fs::remove_dir_all(&backing) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(CellarError::io(backing, e)),
        _ => Ok(()),
    }
}

fn backing_dir_for(root: &Path, tmpfs: &Path) -> PathBuf {
    tmpfs.join(root.strip_prefix("/").unwrap_or(root))
}

fn read_real_path(marker: &Path) -> Result<PathBuf> {
    let raw = std::fs::read_to_string(marker).map_err(|e| CellarError::io(marker, e))?;
    Ok(PathBuf::from(raw.trim_end_matches(['\n', '\r'])))
}

fn verify_backing(marker: &Path, recorded: PathBuf, root: &Path, tmpfs: &Path) -> Result<PathBuf> {
    let expected = backing_dir_for(root, tmpfs);
    if recorded != expected {
        return Err(CellarError::Corrupt {
            path: marker.to_path_buf(),
            reason: format!(
                "marker names {}, expected {}",
                recorded.display(),
                expected.display()
            ),
        });
    }
    Ok(recorded)
}

fn create_private_dir(path: &Path) -> Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .map_err(|e| CellarError::io(path, e))
}
