//! Host filesystem operations.
//!
//! Realizes a container's mount plan with bind mounts.

mod mounts;

pub use mounts::{bind_mount, execute_plan, host_target, teardown, unmount};
