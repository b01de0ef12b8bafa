//! Host criu installation and the files injected into containers.
//!
//! A restore runs criu inside the container, so its binaries and libraries
//! are bound in from the host. `criu-conf.yaml` lists them:
//!
//! ```yaml
//! bins: [criu]
//! libs: [/usr/lib/x86_64-linux-gnu/libprotobuf-c.so.1]
//! ```

use std::path::{Path, PathBuf};

use cellar_common::constants::CRIU_BIN;
use cellar_common::error::{CellarError, Result};
use cellar_common::types::BindPath;
use serde::{Deserialize, Serialize};

/// Container directory receiving injected binaries.
pub const CONTAINER_BIN_DIR: &str = "/usr/bin";

/// Contents of `criu-conf.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriuConfig {
    /// Binaries, by name or path, to bind into `/usr/bin`.
    #[serde(default)]
    pub bins: Vec<String>,
    /// Libraries to bind at their host path.
    #[serde(default)]
    pub libs: Vec<PathBuf>,
}

impl CriuConfig {
    /// Parses the injection config at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| CellarError::io(path, e))?;
        let config = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// Resolves every listed file on the host into read-only binds.
    ///
    /// Binaries are looked up on `PATH` and land in `/usr/bin/<name>`;
    /// libraries keep their host path.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::NotFound`] for a binary that is not installed
    /// or a library that does not exist.
    pub fn resolve(&self) -> Result<Vec<BindPath>> {
        let mut binds = Vec::with_capacity(self.bins.len() + self.libs.len());
        for bin in &self.bins {
            let host = which::which(bin).map_err(|_| CellarError::NotFound {
                kind: "binary",
                id: bin.clone(),
            })?;
            let name = host.file_name().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(bin));
            binds.push(BindPath::read_only(&host, Path::new(CONTAINER_BIN_DIR).join(name)));
        }
        for lib in &self.libs {
            if !lib.exists() {
                return Err(CellarError::NotFound {
                    kind: "library",
                    id: lib.display().to_string(),
                });
            }
            binds.push(BindPath::read_only(lib, lib));
        }
        Ok(binds)
    }
}

/// Checks that criu is on `PATH`, warning when it is not.
pub fn installation_check() -> bool {
    if which::which(CRIU_BIN).is_ok() {
        return true;
    }
    tracing::warn!(
        "unable to locate a criu installation, checkpoint and restore will not work; \
         see https://github.com/checkpoint-restore/criu/blob/criu-dev/INSTALL.md"
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_parses_bins_and_libs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("criu-conf.yaml");
        std::fs::write(&path, "bins:\n  - criu\nlibs:\n  - /lib/libnl.so\n").unwrap();
        let config = CriuConfig::load(&path).unwrap();
        assert_eq!(config.bins, vec!["criu"]);
        assert_eq!(config.libs, vec![PathBuf::from("/lib/libnl.so")]);
    }

    #[test]
    fn load_tolerates_missing_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("criu-conf.yaml");
        std::fs::write(&path, "bins: [criu]\n").unwrap();
        assert!(CriuConfig::load(&path).unwrap().libs.is_empty());
    }

    #[test]
    fn resolve_binds_absolute_binaries_and_libraries() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("fake-criu");
        let lib = dir.path().join("libfake.so");
        std::fs::write(&lib, b"").unwrap();
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        let mut perms = std::fs::metadata(&bin).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&bin, perms).unwrap();

        let config = CriuConfig {
            bins: vec![bin.display().to_string()],
            libs: vec![lib.clone()],
        };
        let binds = config.resolve().unwrap();
        assert_eq!(binds.len(), 2);
        assert_eq!(binds[0].destination, PathBuf::from("/usr/bin/fake-criu"));
        assert!(binds[0].is_readonly());
        assert_eq!(binds[1].destination, lib);
    }

    #[test]
    fn resolve_reports_missing_library() {
        let config = CriuConfig {
            bins: Vec::new(),
            libs: vec![PathBuf::from("/nonexistent/libmissing.so")],
        };
        assert!(matches!(config.resolve(), Err(CellarError::NotFound { kind: "library", .. })));
    }
}
