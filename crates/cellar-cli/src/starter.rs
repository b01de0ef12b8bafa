//! # cellar-starter
//!
//! The binary every stage process runs. `CELLAR_STAGE` selects the stage;
//! the shared configuration arrives at `CELLAR_SCONFIG_FD`.
//!
//! The original thread keeps the process identity and serves the main
//! thread queue. Stage logic runs on a second thread and submits the
//! namespace-sensitive system calls to it.

use cellar_core::mainthread::MainThread;
use cellar_runtime::{signals, stage};

mod logging;

fn main() {
    logging::init();
    // Before any thread exists, so every thread inherits the mask.
    if let Err(e) = signals::block_forwarded() {
        tracing::error!(error = %e, "cannot block forwarded signals");
        std::process::exit(1);
    }

    let (main, handle) = MainThread::new();
    let startup = std::thread::Builder::new()
        .name("startup".into())
        .spawn(move || {
            stage::start(handle);
        });
    if let Err(e) = startup {
        tracing::error!(error = %e, "cannot spawn the startup thread");
        std::process::exit(1);
    }

    main.run();
    tracing::error!("main thread queue closed before the stage finished");
    std::process::exit(1);
}
