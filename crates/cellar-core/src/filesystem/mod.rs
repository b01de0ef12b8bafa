//! Filesystem management for container isolation.
//!
//! Mount, bind, chroot and directory primitives. These are the syscalls the
//! RPC server performs on behalf of stages that lack the capability.

pub mod mount;
