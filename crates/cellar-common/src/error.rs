//! Unified error types for the Cellar workspace.
//!
//! Recoverable failures (missing checkpoints, filesystem errors) travel as
//! `CellarError` values. Fatal conditions use the same type but are
//! terminated at the stage boundary by the dispatcher.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum CellarError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A resource that must not exist yet is already present.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Type of the conflicting resource.
        kind: &'static str,
        /// Identifier of the conflicting resource.
        id: String,
    },

    /// On-disk state is partial or unreadable.
    #[error("corrupt state at {path}: {reason}")]
    Corrupt {
        /// Path of the inconsistent state.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// A permission or capability error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// The shared configuration segment was released more than once.
    #[error("shared configuration already released")]
    AlreadyReleased,

    /// A remote privileged operation failed on the server side.
    #[error("rpc {method} failed: {message}")]
    Rpc {
        /// Method that failed.
        method: &'static str,
        /// Error reported by the server.
        message: String,
    },

    /// The RPC or segment byte stream is malformed.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the framing violation.
        message: String,
    },

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// YAML parsing failed.
    #[error("yaml error: {source}")]
    Yaml {
        /// Underlying YAML error.
        #[from]
        source: serde_yaml::Error,
    },
}

impl CellarError {
    /// Wraps an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds a configuration error from any message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns whether this error reports a missing resource.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CellarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_kind_and_id() {
        let err = CellarError::NotFound {
            kind: "checkpoint",
            id: "ckpt1".into(),
        };
        assert_eq!(err.to_string(), "checkpoint not found: ckpt1");
        assert!(err.is_not_found());
    }

    #[test]
    fn already_released_is_distinct_from_io() {
        let released = CellarError::AlreadyReleased;
        let io = CellarError::io("/tmp", std::io::Error::other("boom"));
        assert!(matches!(released, CellarError::AlreadyReleased));
        assert!(!matches!(io, CellarError::AlreadyReleased));
    }
}
