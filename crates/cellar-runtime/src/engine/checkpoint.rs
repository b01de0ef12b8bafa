//! The checkpoint engine: a native container that criu can dump and restore.
//!
//! A launch runs the configured command and records its host pid in the
//! checkpoint's `cmd.pid`, the tree a later dump targets. A restore runs
//! `criu restore` inside the same container layout instead, using the
//! binaries and images bound in under `/.checkpoint`.

use std::convert::Infallible;
use std::path::Path;

use cellar_checkpoint::commands::{CheckpointPaths, restore_args};
use cellar_common::constants::CONTAINER_STATE_PATH;
use cellar_common::error::{CellarError, Result};

use super::native::{self, CheckpointMode, CheckpointSpec, ContainerConfig};
use super::{
    Creatable, CreatePlan, Engine, EngineConfig, MasterContext, Monitorable, RpcCapable,
    StartContext, Startable,
};

/// Runs checkpointable containers.
#[derive(Debug, Default, Clone, Copy)]
pub struct CheckpointEngine;

fn split(config: &EngineConfig) -> Result<(ContainerConfig, CheckpointSpec)> {
    let container: ContainerConfig = config.decode()?;
    let spec = container
        .checkpoint
        .clone()
        .ok_or_else(|| CellarError::config("the checkpoint engine needs a checkpoint section"))?;
    Ok((container, spec))
}

/// Command Stage2 runs for `container` in `mode`.
pub fn argv_for(container: &ContainerConfig, mode: CheckpointMode) -> Vec<String> {
    match mode {
        CheckpointMode::Launch => container.process.args.clone(),
        CheckpointMode::Restore => restore_args(&CheckpointPaths::container(), container.privileged),
    }
}

impl Engine for CheckpointEngine {
    fn name(&self) -> &'static str {
        "checkpoint"
    }
}

impl Creatable for CheckpointEngine {
    fn create(&self, config: &EngineConfig) -> Result<CreatePlan> {
        let (container, spec) = split(config)?;
        container.validate()?;
        let entry = spec.open()?;
        let state = Path::new(CONTAINER_STATE_PATH);
        if !container.binds.iter().any(|b| b.destination == state) {
            return Err(CellarError::config(format!(
                "checkpoint {} is not bound at {CONTAINER_STATE_PATH}",
                entry.name()
            )));
        }
        tracing::debug!(checkpoint = %entry.name(), kind = %entry.kind(), mode = ?spec.mode, "checkpoint run planned");
        Ok(CreatePlan {
            namespaces: container.namespaces,
        })
    }
}

impl Startable for CheckpointEngine {
    fn start(&self, ctx: StartContext<'_>) -> Result<Infallible> {
        let (container, spec) = split(ctx.config)?;
        let argv = argv_for(&container, spec.mode);
        tracing::info!(mode = ?spec.mode, program = ?argv.first(), "starting checkpointable container");
        native::launch(&container, argv, ctx)
    }

    fn post_start(&self, ctx: &MasterContext) -> Result<()> {
        let (container, spec) = split(&ctx.config)?;
        native::write_pid_file(&container, ctx.process_pid);
        if spec.mode != CheckpointMode::Launch {
            return Ok(());
        }
        let recorded = spec.open().and_then(|e| e.write_pid(ctx.process_pid.as_raw()));
        if let Err(e) = recorded {
            tracing::warn!(checkpoint = %spec.path.display(), error = %e, "failed to record checkpoint pid");
        }
        Ok(())
    }
}

impl Monitorable for CheckpointEngine {}

impl RpcCapable for CheckpointEngine {}
