//! Engines: named sets of lifecycle hooks run by the stages.
//!
//! Each capability is its own trait so stages depend only on the hooks they
//! call. Engines are looked up by name in an [`EngineRegistry`] built once
//! at startup and passed to the dispatcher.

pub mod checkpoint;
pub mod native;

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::os::unix::net::UnixStream;

use cellar_common::error::{CellarError, Result};
use cellar_core::mainthread::MainThreadHandle;
use cellar_core::namespace::NamespaceConfig;
use nix::unistd::Pid;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::master::{self, Outcome, StatusReporter};
use crate::rpc::{RpcClient, RpcHandler, SyscallHandler};

pub use checkpoint::CheckpointEngine;
pub use native::NativeEngine;

/// Engine selection plus its engine-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Registered engine name.
    pub engine: String,
    /// Engine-defined configuration.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EngineConfig {
    /// Wraps `payload` for `engine`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if `payload` cannot be encoded.
    pub fn new(engine: impl Into<String>, payload: &impl Serialize) -> Result<Self> {
        Ok(Self {
            engine: engine.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decodes a serialized config.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for invalid JSON.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Serializes the config.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Registered engine name.
    pub fn name(&self) -> &str {
        &self.engine
    }

    /// Raw payload.
    pub const fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Decodes the payload into the engine's own type.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.payload)?)
    }
}

/// Namespace plan computed by [`Creatable::create`] in Stage1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePlan {
    /// Namespaces the container gets.
    pub namespaces: NamespaceConfig,
}

/// What Stage2 hands to [`Startable::start`].
pub struct StartContext<'a> {
    /// Decoded engine configuration.
    pub config: &'a EngineConfig,
    /// Channel to the RPC server.
    pub rpc: RpcClient<UnixStream>,
    /// Channel to the Master.
    pub status: &'a mut StatusReporter,
    /// Queue of the pinned thread.
    pub main: &'a MainThreadHandle,
}

/// What the Master hands to the supervision hooks.
#[derive(Debug, Clone)]
pub struct MasterContext {
    /// Decoded engine configuration.
    pub config: EngineConfig,
    /// Stage2's host pid, the Master's direct child.
    pub container_pid: Pid,
    /// Host pid of the process running the payload.
    pub process_pid: Pid,
}

/// Runs before any namespace exists.
pub trait Creatable {
    /// Validates the configuration and returns the namespace plan.
    ///
    /// # Errors
    ///
    /// Returns an error for an unusable configuration.
    fn create(&self, config: &EngineConfig) -> Result<CreatePlan>;
}

/// Runs inside the namespaces.
pub trait Startable {
    /// Prepares the container filesystem and runs the payload. Never returns
    /// on success.
    ///
    /// # Errors
    ///
    /// Returns an error if setup or exec fails.
    fn start(&self, ctx: StartContext<'_>) -> Result<Infallible>;

    /// Runs in the Master once the container started.
    ///
    /// # Errors
    ///
    /// Returns an error if a mandatory post-start step fails.
    fn post_start(&self, _ctx: &MasterContext) -> Result<()> {
        Ok(())
    }
}

/// Runs in the Master.
pub trait Monitorable {
    /// Blocks until the container terminates.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be waited for.
    fn monitor(&self, ctx: &MasterContext) -> Result<Outcome> {
        master::wait_for(ctx.container_pid)
    }

    /// Runs after the container terminated.
    ///
    /// # Errors
    ///
    /// Returns an error if cleanup fails.
    fn cleanup(&self, _ctx: &MasterContext) -> Result<()> {
        Ok(())
    }
}

/// Serves privileged operations.
pub trait RpcCapable {
    /// Handler used by the RPC server.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler cannot be built from `config`.
    fn rpc_handler(&self, _config: &EngineConfig) -> Result<Box<dyn RpcHandler>> {
        Ok(Box::new(SyscallHandler::default()))
    }
}

/// A complete engine.
pub trait Engine: Creatable + Startable + Monitorable + RpcCapable + Send + Sync {
    /// Registered name.
    fn name(&self) -> &'static str;
}

/// Immutable name to engine map.
pub struct EngineRegistry {
    engines: BTreeMap<&'static str, Box<dyn Engine>>,
}

impl EngineRegistry {
    /// Registry of the compiled-in engines.
    pub fn builtin() -> Self {
        let engines: Vec<Box<dyn Engine>> = vec![Box::new(NativeEngine), Box::new(CheckpointEngine)];
        Self::from_engines(engines)
    }

    /// Registry of `engines`; a later duplicate name replaces an earlier one.
    pub fn from_engines(engines: Vec<Box<dyn Engine>>) -> Self {
        Self {
            engines: engines.into_iter().map(|e| (e.name(), e)).collect(),
        }
    }

    /// Looks up `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::NotFound`] for an unregistered name.
    pub fn get(&self, name: &str) -> Result<&dyn Engine> {
        self.engines
            .get(name)
            .map(|engine| &**engine)
            .ok_or_else(|| CellarError::NotFound {
                kind: "engine",
                id: name.to_string(),
            })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.engines.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_knows_native_and_checkpoint() {
        let registry = EngineRegistry::builtin();
        assert_eq!(registry.names().collect::<Vec<_>>(), ["checkpoint", "native"]);
        assert_eq!(registry.get("native").unwrap().name(), "native");
    }

    #[test]
    fn unknown_engine_is_not_found() {
        let registry = EngineRegistry::builtin();
        let err = registry.get("singularity").err().unwrap();
        assert!(err.is_not_found());
        assert_eq!(registry.names().count(), 2);
    }

    #[test]
    fn payload_decodes_into_engine_type() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Payload {
            answer: u32,
        }
        let config = EngineConfig::new("native", &Payload { answer: 42 }).unwrap();
        let bytes = config.to_vec().unwrap();
        let back = EngineConfig::from_slice(&bytes).unwrap();
        assert_eq!(back.name(), "native");
        assert_eq!(back.payload()["answer"], 42);
        assert_eq!(back.decode::<Payload>().unwrap(), Payload { answer: 42 });
        assert!(back.decode::<Vec<String>>().is_err());
    }
}
