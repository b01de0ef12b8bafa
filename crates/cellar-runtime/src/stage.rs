//! Stage dispatch for the starter binary.
//!
//! Every starter process runs exactly one stage entry, selected by
//! `CELLAR_STAGE`. Entries never return on success; a failure is logged and
//! terminates the process with status 1.

use std::convert::Infallible;
use std::io::Write;
use std::os::unix::net::UnixStream;

use cellar_common::error::{CellarError, Result};
use cellar_common::types::Stage;
use cellar_core::mainthread::MainThreadHandle;

use crate::engine::{Engine, EngineConfig, EngineRegistry, StartContext};
use crate::master::{self, StatusReporter};
use crate::rpc::{RpcClient, RpcServer};
use crate::shared_config::SharedConfig;

/// The four stage entry points.
pub trait StageEntries {
    /// Validates the configuration and prints the namespace plan.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the configuration.
    fn stage1(&mut self) -> Result<Infallible>;

    /// Enters the container and runs the payload.
    ///
    /// # Errors
    ///
    /// Returns an error if container setup fails.
    fn stage2(&mut self) -> Result<Infallible>;

    /// Supervises the container.
    ///
    /// # Errors
    ///
    /// Returns an error if supervision cannot start.
    fn master(&mut self) -> Result<Infallible>;

    /// Serves privileged requests until Stage2 hangs up.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel breaks.
    fn rpc_server(&mut self) -> Result<Infallible>;
}

/// Runs the entry for `stage`.
///
/// # Errors
///
/// Returns whatever the entry returns.
pub fn run_stage<S: StageEntries>(entries: &mut S, stage: Stage) -> Result<Infallible> {
    match stage {
        Stage::Stage1 => entries.stage1(),
        Stage::Stage2 => entries.stage2(),
        Stage::Master => entries.master(),
        Stage::RpcServer => entries.rpc_server(),
    }
}

/// Runs the entry for `stage` and exits with status 1 if it fails.
pub fn dispatch<S: StageEntries>(entries: &mut S, stage: Stage) -> ! {
    match run_stage(entries, stage) {
        Ok(never) => match never {},
        Err(e) => {
            tracing::error!(%stage, error = %e, "stage failed");
            std::process::exit(1)
        }
    }
}

fn adopt_stream(fd: std::os::fd::RawFd) -> Result<UnixStream> {
    Ok(UnixStream::from(cellar_core::fd::adopt(fd)?))
}

/// Stage entries backed by the shared segment and an engine registry.
pub struct Starter {
    registry: EngineRegistry,
    sconfig: SharedConfig,
    main: MainThreadHandle,
}

impl Starter {
    /// Entries for the stage described in `sconfig`.
    pub const fn new(registry: EngineRegistry, sconfig: SharedConfig, main: MainThreadHandle) -> Self {
        Self {
            registry,
            sconfig,
            main,
        }
    }

    fn engine(&self) -> Result<(&dyn Engine, EngineConfig)> {
        let config = self.sconfig.engine_config()?;
        let engine = self.registry.get(config.name())?;
        Ok((engine, config))
    }
}

impl StageEntries for Starter {
    fn stage1(&mut self) -> Result<Infallible> {
        let (engine, config) = self.engine()?;
        let plan = engine.create(&config)?;
        tracing::debug!(engine = engine.name(), ?plan, "namespace plan computed");

        let mut out = std::io::stdout().lock();
        serde_json::to_writer(&mut out, &plan)?;
        writeln!(out)
            .and_then(|()| out.flush())
            .map_err(|e| CellarError::io("stdout", e))?;
        std::process::exit(0)
    }

    fn stage2(&mut self) -> Result<Infallible> {
        self.sconfig.release()?;
        let [rpc_fd, _] = self.sconfig.rpc_fds();
        let [_, status_fd] = self.sconfig.master_fds();
        let mut status = StatusReporter::from_fd(status_fd)?;
        let started = RpcClient::from_fd(rpc_fd).and_then(|rpc| {
            let (engine, config) = self.engine()?;
            engine.start(StartContext {
                config: &config,
                rpc,
                status: &mut status,
                main: &self.main,
            })
        });
        match started {
            Ok(never) => match never {},
            Err(e) => {
                status.failed(&e);
                Err(e)
            }
        }
    }

    fn master(&mut self) -> Result<Infallible> {
        self.sconfig.release()?;
        let [master_fd, _] = self.sconfig.master_fds();
        let stream = adopt_stream(master_fd)?;
        let (engine, config) = self.engine()?;
        master::run(engine, config, self.sconfig.container_pid()?, stream)
    }

    fn rpc_server(&mut self) -> Result<Infallible> {
        self.sconfig.release()?;
        let [_, server_fd] = self.sconfig.rpc_fds();
        let stream = adopt_stream(server_fd)?;
        let (engine, config) = self.engine()?;
        let server = RpcServer::new(stream, engine.rpc_handler(&config)?);
        tracing::debug!(engine = engine.name(), "rpc server ready");
        self.main.execute(move || server.serve())??;
        std::process::exit(0)
    }
}

/// Runs the stage named in the environment on behalf of the starter binary.
///
/// `main` is the queue of the thread that holds the process's original
/// identity; it must be consumed on that thread while this runs.
pub fn start(main: MainThreadHandle) -> ! {
    let sconfig = match SharedConfig::from_env() {
        Ok(sconfig) => sconfig,
        Err(e) => {
            tracing::error!(error = %e, "cannot open the shared configuration");
            std::process::exit(1)
        }
    };
    let stage = sconfig.stage();
    let span = tracing::info_span!("stage", %stage, pid = std::process::id());
    let _entered = span.enter();
    tracing::debug!("stage starting");
    let mut starter = Starter::new(EngineRegistry::builtin(), sconfig, main);
    dispatch(&mut starter, stage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Stage>,
    }

    impl Recorder {
        fn record(&mut self, stage: Stage) -> Result<Infallible> {
            self.calls.push(stage);
            Err(CellarError::config(format!("{stage} recorded")))
        }
    }

    impl StageEntries for Recorder {
        fn stage1(&mut self) -> Result<Infallible> {
            self.record(Stage::Stage1)
        }

        fn stage2(&mut self) -> Result<Infallible> {
            self.record(Stage::Stage2)
        }

        fn master(&mut self) -> Result<Infallible> {
            self.record(Stage::Master)
        }

        fn rpc_server(&mut self) -> Result<Infallible> {
            self.record(Stage::RpcServer)
        }
    }

    #[test]
    fn exactly_one_entry_runs_per_stage() {
        for stage in Stage::ALL {
            let mut recorder = Recorder::default();
            let err = run_stage(&mut recorder, stage).unwrap_err();
            assert_eq!(recorder.calls, [stage]);
            assert!(err.to_string().contains(stage.as_str()));
        }
    }
}
