//! Named checkpoint directories under a checkpoint root.
//!
//! `name → <root>/<name>` is the whole registry. Nothing is cached: every
//! call re-derives existence and kind from disk, which keeps the state
//! consistent across crashes and restarts. The only atomicity offered is
//! that of `mkdir(2)`.

use std::path::{Path, PathBuf};

use cellar_common::config::CellarConfig;
use cellar_common::error::{CellarError, Result};

use crate::entry::{self, CheckpointEntry, CheckpointKind};

/// Creates, inspects and removes checkpoint directories.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    root: PathBuf,
    tmpfs: PathBuf,
}

impl CheckpointManager {
    /// Manages checkpoints under `root`, placing memory images under `tmpfs`.
    pub fn new(root: impl Into<PathBuf>, tmpfs: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tmpfs: tmpfs.into(),
        }
    }

    /// Builds a manager from the runtime configuration.
    pub fn from_config(config: &CellarConfig) -> Self {
        Self::new(&config.checkpoint_dir, &config.tmpfs_dir)
    }

    /// The checkpoint root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    /// Creates checkpoint `name` of the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::AlreadyExists`] if the directory exists, a
    /// configuration error for invalid names, and an I/O error otherwise.
    /// A half-created entry is removed before the error is returned.
    pub fn create(&self, name: &str, kind: CheckpointKind) -> Result<CheckpointEntry> {
        let dir = self.entry_dir(name)?;
        std::fs::create_dir_all(&self.root).map_err(|e| CellarError::io(&self.root, e))?;
        match std::fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(CellarError::AlreadyExists {
                    kind: "checkpoint",
                    id: name.to_string(),
                });
            }
            Err(e) => return Err(CellarError::io(&dir, e)),
        }

        if let Err(e) = entry::create_image_dir(&dir, kind, &self.tmpfs) {
            self.discard(name, &dir);
            return Err(e);
        }
        tracing::info!(checkpoint = name, %kind, path = %dir.display(), "checkpoint created");
        CheckpointEntry::open(dir, &self.tmpfs)
    }

    /// Opens checkpoint `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::NotFound`] if the directory is absent and a
    /// classification error if the entry is corrupt.
    pub fn get(&self, name: &str) -> Result<CheckpointEntry> {
        let dir = self.entry_dir(name)?;
        if !dir.is_dir() {
            return Err(CellarError::NotFound {
                kind: "checkpoint",
                id: name.to_string(),
            });
        }
        CheckpointEntry::open(dir, &self.tmpfs)
    }

    /// Removes a half-created entry; failures are logged.
    fn discard(&self, name: &str, dir: &Path) {
        if let Err(e) = entry::remove_backing_dir(dir, &self.tmpfs) {
            tracing::warn!(checkpoint = name, error = %e, "rollback could not remove backing directory");
        }
        if let Err(e) = std::fs::remove_dir_all(dir) {
            tracing::warn!(checkpoint = name, path = %dir.display(), error = %e, "rollback could not remove checkpoint directory");
        }
    }

    /// Moves checkpoint `name` to `kind`.
    ///
    /// Asking for the current kind only runs [`CheckpointEntry::sync`].
    /// Otherwise the image directory is torn down (backing directory first)
    /// and recreated; existing images are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::NotFound`] if the entry is absent and an I/O
    /// error if the image directory cannot be rebuilt.
    pub fn config(&self, name: &str, kind: CheckpointKind) -> Result<CheckpointEntry> {
        let current = self.get(name)?;
        if current.kind() == kind {
            current.sync()?;
            return Ok(current);
        }

        let img = current.image_dir();
        if current.kind() == CheckpointKind::Memory {
            entry::remove_backing_dir(current.path(), &self.tmpfs)?;
        }
        std::fs::remove_dir_all(&img).map_err(|e| CellarError::io(&img, e))?;
        entry::create_image_dir(current.path(), kind, &self.tmpfs)?;
        tracing::info!(checkpoint = name, from = %current.kind(), to = %kind, "checkpoint reconfigured");
        CheckpointEntry::open(current.path(), &self.tmpfs)
    }

    /// Lists every classifiable checkpoint; corrupt entries are skipped.
    ///
    /// A missing root yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error if the root exists but cannot be read.
    pub fn list(&self) -> Result<Vec<CheckpointEntry>> {
        let dir = match std::fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CellarError::io(&self.root, e)),
        };

        let mut entries = Vec::new();
        for child in dir.flatten() {
            if !child.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            match CheckpointEntry::open(child.path(), &self.tmpfs) {
                Ok(entry) => {
                    tracing::debug!(path = %entry.path().display(), kind = %entry.kind(), "checkpoint listed");
                    entries.push(entry);
                }
                Err(e) => {
                    tracing::debug!(path = %child.path().display(), error = %e, "skipping unclassifiable checkpoint");
                }
            }
        }
        entries.sort_by_key(CheckpointEntry::name);
        Ok(entries)
    }

    /// Deletes checkpoint `name`.
    ///
    /// The backing directory goes first so no live image store is orphaned
    /// once the metadata tree that points at it is gone.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::NotFound`] if the entry is absent and an I/O
    /// error if either tree cannot be removed.
    pub fn delete(&self, name: &str) -> Result<()> {
        let dir = self.entry_dir(name)?;
        if !dir.is_dir() {
            return Err(CellarError::NotFound {
                kind: "checkpoint",
                id: name.to_string(),
            });
        }
        if let Err(e) = entry::remove_backing_dir(&dir, &self.tmpfs) {
            tracing::warn!(checkpoint = name, error = %e, "removing backing directory failed");
        }
        std::fs::remove_dir_all(&dir).map_err(|e| CellarError::io(&dir, e))?;
        tracing::info!(checkpoint = name, "checkpoint deleted");
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CellarError::config("checkpoint name must not be empty"));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(CellarError::config(format!("invalid checkpoint name: {name:?}")));
    }
    Ok(())
}
