//! # berth
//!
//! Volume lifecycle manager for containers.
//!
//! berth tracks named volumes, anonymous volumes and bind mounts from
//! container creation, through start, to removal:
//!
//! - **Resolution**: declared mounts become referenced, allocated volumes,
//!   atomically per container
//! - **Overlay**: the container's view layers mounts over the image, with the
//!   most specific mount winning at every path
//! - **Collection**: removal releases references and deletes anonymous
//!   volumes that are no longer needed
//!
//! ## Usage
//!
//! ```no_run
//! use berth::runtime::{CreateContainer, Engine, EngineConfig};
//! use berth::volume::ContainerMountSet;
//!
//! # fn example() -> berth_common::BerthResult<()> {
//! let engine = Engine::open(EngineConfig::default().with_root("/tmp/berth"))?;
//!
//! let id = engine.create_container(CreateContainer {
//!     image: "node".to_string(),
//!     mounts: ContainerMountSet::parse(&["/home/me/app:/app", "/app/node_modules"])?,
//!     auto_remove: true,
//!     ..CreateContainer::default()
//! })?;
//!
//! let view = engine.start_container(&id)?;
//! assert!(view.exists("/app/node_modules")?);
//!
//! engine.remove_container(&id, false)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod filesystem;
pub mod runtime;
pub mod volume;

pub use runtime::Engine;
