//! Container supervision.
//!
//! The Master is the parent of Stage2. It waits for Stage2 to report that
//! the container started, relays forwarded signals, reaps the container and
//! turns its termination into the Master's own exit code.

use std::convert::Infallible;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use cellar_common::error::{CellarError, Result};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::engine::{Engine, EngineConfig, MasterContext};
use crate::signals;

/// How the container terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Normal exit with a status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
}

impl Outcome {
    /// Exit code surfaced by the Master: the status, or `128 + signo`.
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signal) => 128 + signal as i32,
        }
    }

    /// Normalizes a wait status; `None` for stops and continues.
    pub const fn from_wait_status(status: WaitStatus) -> Option<(Pid, Self)> {
        match status {
            WaitStatus::Exited(pid, code) => Some((pid, Self::Exited(code))),
            WaitStatus::Signaled(pid, signal, _) => Some((pid, Self::Signaled(signal))),
            _ => None,
        }
    }
}

impl From<ExitStatus> for Outcome {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        status
            .signal()
            .and_then(|signo| Signal::try_from(signo).ok())
            .map_or(Self::Exited(1), Self::Signaled)
    }
}

/// Supervision progress. Terminal states never move back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    /// The container has not terminated yet.
    Running,
    /// The container terminated; the outcome is not reported yet.
    Finished(Outcome),
    /// The outcome was surfaced as the exit code.
    Reported(Outcome),
}

impl MasterState {
    /// Records the container's termination.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Protocol`] unless the state is `Running`.
    pub fn finish(self, outcome: Outcome) -> Result<Self> {
        match self {
            Self::Running => Ok(Self::Finished(outcome)),
            other => Err(CellarError::Protocol {
                message: format!("cannot record {outcome:?} in state {other:?}"),
            }),
        }
    }

    /// Moves to `Reported`, returning the exit code to surface.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Protocol`] unless the state is `Finished`.
    pub fn report(self) -> Result<(Self, i32)> {
        match self {
            Self::Finished(outcome) => Ok((Self::Reported(outcome), outcome.exit_code())),
            other => Err(CellarError::Protocol {
                message: format!("nothing to report in state {other:?}"),
            }),
        }
    }

    /// The recorded outcome, if any.
    pub const fn outcome(self) -> Option<Outcome> {
        match self {
            Self::Running => None,
            Self::Finished(outcome) | Self::Reported(outcome) => Some(outcome),
        }
    }
}

/// Message Stage2 sends on the status channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartStatus {
    /// The container process was spawned under a supervising Stage2.
    Started {
        /// Host pid of the container process.
        pid: i32,
    },
    /// Stage2 failed before the container ran.
    Failed {
        /// Rendered error.
        error: String,
    },
}

/// Stage2's end of the status channel.
///
/// Closing the channel without a message means the container process was
/// exec'd in place of Stage2.
#[derive(Debug)]
pub struct StatusReporter {
    stream: Option<UnixStream>,
}

impl StatusReporter {
    /// Reporter over a connected stream.
    pub const fn new(stream: UnixStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    /// Reporter over the inherited socket at `fd`, closed on exec.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor is not open.
    pub fn from_fd(fd: RawFd) -> Result<Self> {
        let owned = cellar_core::fd::adopt(fd)?;
        cellar_core::fd::set_cloexec(fd, true)?;
        Ok(Self::new(UnixStream::from(owned)))
    }

    fn send(&mut self, status: &StartStatus) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Err(CellarError::Protocol {
                message: "status already reported".into(),
            });
        };
        let mut line = serde_json::to_vec(status)?;
        line.push(b'\n');
        stream
            .write_all(&line)
            .map_err(|e| CellarError::io("status-channel", e))
    }

    /// Reports a supervised container process and closes the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the status was already sent or cannot be written.
    pub fn started(&mut self, pid: i32) -> Result<()> {
        self.send(&StartStatus::Started { pid })
    }

    /// Reports a Stage2 failure; the channel may already be gone.
    pub fn failed(&mut self, error: &CellarError) {
        if self.stream.is_none() {
            return;
        }
        if let Err(e) = self.send(&StartStatus::Failed {
            error: error.to_string(),
        }) {
            tracing::warn!(error = %e, "could not report failure to the master");
        }
    }
}

/// Reads the start status until Stage2 closes its end.
///
/// # Errors
///
/// Returns an error if the channel cannot be read or carries an invalid
/// message.
pub fn read_status<R: Read>(reader: R) -> Result<Option<StartStatus>> {
    let mut line = String::new();
    let _ = BufReader::new(reader)
        .read_line(&mut line)
        .map_err(|e| CellarError::io("status-channel", e))?;
    if line.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line.trim())?))
}

/// Reaps children until `pid` terminates.
///
/// # Errors
///
/// Returns [`CellarError::Protocol`] if `pid` is not a child of the caller.
pub fn wait_for(pid: Pid) -> Result<Outcome> {
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(status) => match Outcome::from_wait_status(status) {
                Some((reaped, outcome)) if reaped == pid => return Ok(outcome),
                Some((reaped, outcome)) => {
                    tracing::debug!(%reaped, ?outcome, "reaped sibling process");
                }
                None => {}
            },
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => {
                return Err(CellarError::Protocol {
                    message: format!("container {pid} is not a child of the master"),
                });
            }
            Err(e) => return Err(CellarError::io("waitpid", e.into())),
        }
    }
}

fn reap_remaining() {
    while let Ok(status) = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
        if status == WaitStatus::StillAlive {
            break;
        }
        tracing::debug!(?status, "reaped leftover child");
    }
}

/// Supervises the container and exits with its outcome.
///
/// # Errors
///
/// Returns an error if Stage2 reports a failure or a hook fails; the
/// caller turns it into a non-zero exit.
pub fn run(
    engine: &dyn Engine,
    config: EngineConfig,
    container_pid: i32,
    status: UnixStream,
) -> Result<Infallible> {
    if container_pid <= 0 {
        return Err(CellarError::config(
            "shared configuration carries no container pid",
        ));
    }
    let container = Pid::from_raw(container_pid);
    let _relay = signals::spawn_forwarder(container)?;

    let process = match read_status(status)? {
        None => container,
        Some(StartStatus::Started { pid }) => Pid::from_raw(pid),
        Some(StartStatus::Failed { error }) => {
            return Err(CellarError::config(format!("container failed to start: {error}")));
        }
    };
    tracing::info!(engine = engine.name(), %container, %process, "container started");

    let ctx = MasterContext {
        config,
        container_pid: container,
        process_pid: process,
    };
    engine.post_start(&ctx)?;

    let state = MasterState::Running.finish(engine.monitor(&ctx)?)?;
    engine.cleanup(&ctx)?;
    reap_remaining();

    let (state, code) = state.report()?;
    tracing::info!(outcome = ?state.outcome(), code, "container finished");
    std::process::exit(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_outcomes_map_above_128() {
        assert_eq!(Outcome::Exited(3).exit_code(), 3);
        assert_eq!(Outcome::Signaled(Signal::SIGKILL).exit_code(), 137);
        assert_eq!(Outcome::Signaled(Signal::SIGTERM).exit_code(), 143);
    }

    #[test]
    fn wait_statuses_normalize() {
        let pid = Pid::from_raw(42);
        assert_eq!(
            Outcome::from_wait_status(WaitStatus::Exited(pid, 0)),
            Some((pid, Outcome::Exited(0)))
        );
        assert_eq!(
            Outcome::from_wait_status(WaitStatus::Signaled(pid, Signal::SIGINT, false)),
            Some((pid, Outcome::Signaled(Signal::SIGINT)))
        );
        assert_eq!(Outcome::from_wait_status(WaitStatus::StillAlive), None);
    }

    #[test]
    fn exit_status_conversion() {
        assert_eq!(Outcome::from(ExitStatus::from_raw(2 << 8)), Outcome::Exited(2));
        assert_eq!(
            Outcome::from(ExitStatus::from_raw(libc::SIGTERM)),
            Outcome::Signaled(Signal::SIGTERM)
        );
    }

    #[test]
    fn states_are_terminal() {
        let finished = MasterState::Running.finish(Outcome::Exited(0)).unwrap();
        assert!(finished.finish(Outcome::Exited(1)).is_err());
        let (reported, code) = finished.report().unwrap();
        assert_eq!(code, 0);
        assert_eq!(reported.outcome(), Some(Outcome::Exited(0)));
        assert!(reported.report().is_err());
        assert!(MasterState::Running.report().is_err());
    }

    #[test]
    fn closed_channel_means_exec() {
        let (master, stage2) = UnixStream::pair().unwrap();
        drop(stage2);
        assert_eq!(read_status(master).unwrap(), None);
    }

    #[test]
    fn started_and_failed_are_delivered() {
        let (master, stage2) = UnixStream::pair().unwrap();
        let mut reporter = StatusReporter::new(stage2);
        reporter.started(1234).unwrap();
        assert!(reporter.started(1).is_err());
        assert_eq!(
            read_status(master).unwrap(),
            Some(StartStatus::Started { pid: 1234 })
        );

        let (master, stage2) = UnixStream::pair().unwrap();
        let mut reporter = StatusReporter::new(stage2);
        reporter.failed(&CellarError::config("no rootfs"));
        drop(reporter);
        assert!(matches!(
            read_status(master).unwrap(),
            Some(StartStatus::Failed { error }) if error.contains("no rootfs")
        ));
    }
}
