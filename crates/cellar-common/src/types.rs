//! Domain primitive types used across the Cellar workspace.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CellarError;

/// Execution context a starter process runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Prepares the namespace plan before the container exists.
    Stage1,
    /// Runs inside the namespaces and execs the container process.
    Stage2,
    /// Supervises the container and reports its outcome.
    Master,
    /// Serves privileged operations for the other stages.
    RpcServer,
}

impl Stage {
    /// All stages, in launch order.
    pub const ALL: [Self; 4] = [Self::Stage1, Self::RpcServer, Self::Stage2, Self::Master];

    /// Stable name used in the `CELLAR_STAGE` environment variable.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stage1 => "stage1",
            Self::Stage2 => "stage2",
            Self::Master => "master",
            Self::RpcServer => "rpc-server",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = CellarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| CellarError::config(format!("unknown stage selector: {s}")))
    }
}

/// Mount option attached to a bind path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindOption {
    /// Writable bind.
    Rw,
    /// Read-only bind.
    Ro,
    /// Ignore set-user-id bits.
    Nosuid,
    /// Ignore device files.
    Nodev,
}

impl FromStr for BindOption {
    type Err = CellarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rw" => Ok(Self::Rw),
            "ro" => Ok(Self::Ro),
            "nosuid" => Ok(Self::Nosuid),
            "nodev" => Ok(Self::Nodev),
            other => Err(CellarError::config(format!("unknown bind option: {other}"))),
        }
    }
}

/// A host path bound into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindPath {
    /// Host-side source path.
    pub source: PathBuf,
    /// Absolute path inside the container.
    pub destination: PathBuf,
    /// Mount options.
    #[serde(default)]
    pub options: BTreeSet<BindOption>,
}

impl BindPath {
    /// Creates a writable bind.
    pub fn read_write(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            options: BTreeSet::from([BindOption::Rw]),
        }
    }

    /// Creates a read-only bind.
    pub fn read_only(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            options: BTreeSet::from([BindOption::Ro]),
        }
    }

    /// Returns whether the bind must be remounted read-only.
    pub fn is_readonly(&self) -> bool {
        self.options.contains(&BindOption::Ro)
    }
}

/// Parses `src[:dst[:opt,opt]]`; a missing destination mirrors the source.
impl FromStr for BindPath {
    type Err = CellarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let source = parts.next().filter(|p| !p.is_empty()).ok_or_else(|| {
            CellarError::config(format!("bind path has no source: {s:?}"))
        })?;
        let destination = parts.next().filter(|p| !p.is_empty()).unwrap_or(source);
        if !destination.starts_with('/') {
            return Err(CellarError::config(format!(
                "bind destination must be absolute: {destination}"
            )));
        }
        let options = match parts.next() {
            Some(opts) => opts
                .split(',')
                .filter(|o| !o.is_empty())
                .map(BindOption::from_str)
                .collect::<Result<BTreeSet<_>, _>>()?,
            None => BTreeSet::from([BindOption::Rw]),
        };
        if options.contains(&BindOption::Ro) && options.contains(&BindOption::Rw) {
            return Err(CellarError::config(format!("bind {s:?} is both ro and rw")));
        }
        Ok(Self {
            source: PathBuf::from(source),
            destination: PathBuf::from(destination),
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_parse_back() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("stage3".parse::<Stage>().is_err());
    }

    #[test]
    fn bind_without_destination_mirrors_source() {
        let bind: BindPath = "/opt/data".parse().unwrap();
        assert_eq!(bind.destination, PathBuf::from("/opt/data"));
        assert!(bind.options.contains(&BindOption::Rw));
    }

    #[test]
    fn bind_with_options() {
        let bind: BindPath = "/usr/sbin/criu:/usr/bin/criu:ro,nosuid".parse().unwrap();
        assert!(bind.is_readonly());
        assert!(bind.options.contains(&BindOption::Nosuid));
        assert_eq!(bind.destination, PathBuf::from("/usr/bin/criu"));
    }

    #[test]
    fn bind_rejects_relative_destination_and_conflicting_options() {
        assert!("/a:relative".parse::<BindPath>().is_err());
        assert!("/a:/b:ro,rw".parse::<BindPath>().is_err());
        assert!("/a:/b:exec".parse::<BindPath>().is_err());
        assert!("".parse::<BindPath>().is_err());
    }
}
