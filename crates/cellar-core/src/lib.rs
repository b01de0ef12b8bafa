//! # cellar-core
//!
//! Low-level Linux isolation primitives for the Cellar runtime.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: the container's namespace plan and mount namespace handles.
//! - **Filesystem**: `mount(2)`, `chroot(2)` and directory creation.
//! - **Loop devices**: attaching image files through `/dev/loop-control`.
//! - **Sealed memory**: `memfd_create(2)` segments sealed against writes.
//! - **Main thread**: a single-worker queue for thread-affine syscalls.
//! - **Descriptors**: adopting inherited descriptors and closing stray ones.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod fd;
pub mod filesystem;
pub mod loop_device;
pub mod mainthread;
pub mod memfd;
pub mod namespace;
