//! Signal relaying from a supervisor to the process it watches.
//!
//! Forwarded signals are blocked in every thread of a starter before any
//! thread is spawned; a dedicated thread picks them up with `sigwait` and
//! sends them on. Children unblock them again before exec.

use std::thread::JoinHandle;

use cellar_common::error::{CellarError, Result};
use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal, kill};
use nix::unistd::Pid;

/// Signals relayed to the container.
pub const FORWARDED: [Signal; 6] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

/// The forwarded signals as a set.
pub fn forwarded_set() -> SigSet {
    let mut set = SigSet::empty();
    for signal in FORWARDED {
        set.add(signal);
    }
    set
}

/// Blocks the forwarded signals in the calling thread.
///
/// # Errors
///
/// Returns an error if `pthread_sigmask(2)` fails.
pub fn block_forwarded() -> Result<()> {
    forwarded_set()
        .thread_block()
        .map_err(|e| CellarError::PermissionDenied {
            message: format!("blocking forwarded signals failed: {e}"),
        })
}

/// Unblocks the forwarded signals. Async-signal-safe, for `pre_exec`.
///
/// # Errors
///
/// Returns the raw errno of `pthread_sigmask(2)`.
pub fn unblock_forwarded() -> std::io::Result<()> {
    forwarded_set().thread_unblock().map_err(std::io::Error::from)
}

/// Relays every forwarded signal to `target` until it is gone.
///
/// # Errors
///
/// Returns an error if the relay thread cannot be spawned.
pub fn spawn_forwarder(target: Pid) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("signal-relay".into())
        .spawn(move || relay(target))
        .map_err(|e| CellarError::io("signal-relay", e))
}

fn relay(target: Pid) {
    let set = forwarded_set();
    loop {
        let signal = match set.wait() {
            Ok(signal) => signal,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::error!(error = %e, "sigwait failed, signals are no longer relayed");
                return;
            }
        };
        match kill(target, signal) {
            Ok(()) => tracing::debug!(%target, ?signal, "signal relayed"),
            Err(Errno::ESRCH) => return,
            Err(e) => tracing::warn!(%target, ?signal, error = %e, "relaying signal failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relays_termination_but_not_kill() {
        let set = forwarded_set();
        assert!(set.contains(Signal::SIGTERM));
        assert!(set.contains(Signal::SIGUSR2));
        assert!(!set.contains(Signal::SIGKILL));
        assert!(!set.contains(Signal::SIGCHLD));
    }
}
