//! Container runtime core.
//!
//! This module provides the [`Engine`] and the container records it manages.

mod config;
mod container;
mod engine;
pub mod events;
mod state;

pub use config::EngineConfig;
pub use container::{ContainerRecord, ContainerStatus};
pub use engine::{CreateContainer, Engine};
pub use events::{EventBus, RuntimeEvent};
pub use state::StateManager;
