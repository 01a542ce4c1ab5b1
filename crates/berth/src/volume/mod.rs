//! Volume lifecycle management.
//!
//! - [`store`]: persistent volume records and reference sets
//! - [`resolver`]: turns declared mounts into tracked, allocated mounts
//! - [`overlay`]: computes what a container sees at start
//! - [`collector`]: releases references and deletes unneeded volumes

pub mod collector;
pub mod driver;
pub mod overlay;
pub mod record;
pub mod resolver;
pub mod spec;
pub mod store;

pub use collector::{CollectionReport, LifecycleCollector, PruneReport};
pub use driver::{LocalDriver, VolumeDriver};
pub use overlay::{EffectiveView, Layer, MountLayer, MountOverlayApplier, PlannedMount, Resolution};
pub use record::{VolumeKind, VolumeRecord, VolumeState, VolumeSummary};
pub use resolver::{ResolveOptions, VolumeResolver};
pub use spec::{BindSpec, ContainerMountSet, MountSource, MountSpec, ResolvedMount};
pub use store::{Acquired, MountReferenceStore, VolumeOptions};
