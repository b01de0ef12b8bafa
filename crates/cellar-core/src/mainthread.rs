//! Single-worker executor pinned to the process's original thread.
//!
//! Namespace syscalls act on the calling thread, so every one of them is
//! funnelled through this queue. The thread that creates the [`MainThread`]
//! consumes it in [`MainThread::run`]; stage logic runs elsewhere and submits
//! closures with [`MainThreadHandle::execute`], blocking until they finish.

use std::sync::mpsc;
use std::thread::{self, ThreadId};

use cellar_common::error::{CellarError, Result};

type Job = Box<dyn FnOnce() + Send>;

/// Consumer side of the queue. Not `Send`: it stays on the creating thread.
pub struct MainThread {
    jobs: mpsc::Receiver<Job>,
    thread: ThreadId,
    _pinned: std::marker::PhantomData<*const ()>,
}

/// Submission side of the queue.
#[derive(Clone)]
pub struct MainThreadHandle {
    jobs: mpsc::Sender<Job>,
    thread: ThreadId,
}

impl MainThread {
    /// Creates the queue, pinning it to the current thread.
    pub fn new() -> (Self, MainThreadHandle) {
        let (tx, rx) = mpsc::channel();
        let thread = thread::current().id();
        (
            Self {
                jobs: rx,
                thread,
                _pinned: std::marker::PhantomData,
            },
            MainThreadHandle { jobs: tx, thread },
        )
    }

    /// Runs queued jobs until every handle has been dropped.
    pub fn run(self) {
        debug_assert_eq!(thread::current().id(), self.thread);
        for job in self.jobs {
            job();
        }
        tracing::debug!("main thread queue closed");
    }
}

impl MainThreadHandle {
    /// Runs `f` on the pinned thread and returns its result.
    ///
    /// Calling this from the pinned thread itself runs `f` inline; queueing
    /// would deadlock.
    ///
    /// # Errors
    ///
    /// Returns an error if the pinned thread stopped consuming the queue or
    /// the job panicked before producing a result.
    pub fn execute<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if thread::current().id() == self.thread {
            return Ok(f());
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.jobs
            .send(Box::new(move || {
                let _ = tx.send(f());
            }))
            .map_err(|_| CellarError::Protocol {
                message: "main thread queue is closed".into(),
            })?;
        rx.recv().map_err(|_| CellarError::Protocol {
            message: "main thread job ended without a result".into(),
        })
    }

    /// Identifier of the pinned thread.
    pub const fn thread_id(&self) -> ThreadId {
        self.thread
    }
}
