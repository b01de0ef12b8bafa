//! Global configuration model for the Cellar runtime.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CellarError, Result};

/// Root configuration for the Cellar runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellarConfig {
    /// Base directory for Cellar state and data.
    pub data_dir: PathBuf,
    /// Root under which named checkpoint directories live.
    pub checkpoint_dir: PathBuf,
    /// Volatile storage root for memory-backed checkpoint images.
    pub tmpfs_dir: PathBuf,
    /// Path of the YAML file listing criu binaries and libraries to inject.
    pub criu_config: PathBuf,
    /// Explicit path of the per-stage starter binary, if not on `PATH`.
    pub starter: Option<PathBuf>,
}

impl Default for CellarConfig {
    fn default() -> Self {
        Self {
            data_dir: crate::constants::data_dir().clone(),
            checkpoint_dir: crate::constants::default_checkpoint_dir(),
            tmpfs_dir: PathBuf::from(crate::constants::DEFAULT_TMPFS_DIR),
            criu_config: crate::constants::default_criu_config(),
            starter: None,
        }
    }
}

impl CellarConfig {
    /// Loads a configuration file, filling absent keys with defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| CellarError::io(path, e))?;
        let config: Self = serde_json::from_str(&raw)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Finds the active configuration.
    ///
    /// `$CELLAR_CONFIG` wins, then `<data_dir>/cellar.json`; when neither
    /// exists the defaults are used.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file exists but cannot be parsed.
    pub fn discover() -> Result<Self> {
        if let Ok(path) = std::env::var("CELLAR_CONFIG") {
            return Self::load(Path::new(&path));
        }
        let candidate = crate::constants::data_dir().join("cellar.json");
        if candidate.is_file() {
            return Self::load(&candidate);
        }
        Ok(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fills_missing_keys_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cellar.json");
        std::fs::write(&path, r#"{ "tmpfs_dir": "/run/cellar-shm" }"#).unwrap();

        let config = CellarConfig::load(&path).unwrap();
        assert_eq!(config.tmpfs_dir, PathBuf::from("/run/cellar-shm"));
        assert_eq!(config.checkpoint_dir, CellarConfig::default().checkpoint_dir);
        assert!(config.starter.is_none());
    }

    #[test]
    fn load_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cellar.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            CellarConfig::load(&path),
            Err(CellarError::Serialization { .. })
        ));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = CellarConfig::load(Path::new("/nonexistent/cellar.json")).unwrap_err();
        assert!(matches!(err, CellarError::Io { .. }));
    }
}
