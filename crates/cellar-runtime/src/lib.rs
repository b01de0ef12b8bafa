//! Stage pipeline of the Cellar runtime.
//!
//! One `cellar instance start` becomes four cooperating processes:
//! Stage1 computes the namespace plan, the RPC server performs privileged
//! filesystem work, Stage2 enters the namespaces and execs the target, and
//! the Master supervises it. They share a sealed configuration segment and
//! talk over socket pairs placed at fixed descriptors by [`bootstrap`].

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod bootstrap;
pub mod engine;
pub mod master;
pub mod rpc;
pub mod shared_config;
pub mod signals;
pub mod stage;
