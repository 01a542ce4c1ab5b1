//! # berth-common
//!
//! Shared types for the berth volume manager:
//! - Container and volume identifiers
//! - Standard filesystem paths
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{BerthError, BerthResult};
pub use id::{ContainerId, VolumeId};
pub use paths::BerthPaths;
