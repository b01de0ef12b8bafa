//! Checkpoint state directories for the Cellar runtime.
//!
//! A checkpoint is a named directory under the checkpoint root. Its kind
//! (disk or memory) is never stored: it is recomputed from the `real_path`
//! marker every time an entry is opened, so the filesystem is the registry.
//! Operations on one name are not locked; callers that may race on a name
//! must serialize through their own advisory lock.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod commands;
pub mod criu;
pub mod entry;
pub mod manager;

pub use entry::{CheckpointEntry, CheckpointKind, LogPaths, RunKind};
pub use manager::CheckpointManager;
