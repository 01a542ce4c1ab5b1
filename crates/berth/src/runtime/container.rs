//! Container records.

use std::fmt;
use std::path::PathBuf;

use berth_common::ContainerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::volume::{ContainerMountSet, ResolvedMount};

/// Lifecycle status of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Volumes resolved, not yet started.
    Created,
    /// Mount overlay applied.
    Running,
    /// Stopped; volumes still referenced.
    Stopped,
}

impl ContainerStatus {
    /// Whether the overlay may be applied from this status.
    #[must_use]
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Created | Self::Stopped)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Persisted state of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Container identity.
    pub id: ContainerId,
    /// Image reference as given at creation.
    pub image: String,
    /// Extracted image root filesystem.
    pub rootfs: PathBuf,
    /// Mounts in declaration order.
    pub mounts: ContainerMountSet,
    /// Mounts as resolved at creation, parallel to `mounts`.
    pub resolved: Vec<ResolvedMount>,
    /// Delete anonymous volumes on removal.
    pub auto_remove: bool,
    /// Current status.
    pub status: ContainerStatus,
    /// Creation time.
    pub created: DateTime<Utc>,
}

impl ContainerRecord {
    /// Build a freshly created container record.
    pub fn new(
        id: ContainerId,
        image: impl Into<String>,
        rootfs: PathBuf,
        mounts: ContainerMountSet,
        resolved: Vec<ResolvedMount>,
        auto_remove: bool,
    ) -> Self {
        Self {
            id,
            image: image.into(),
            rootfs,
            mounts,
            resolved,
            auto_remove,
            status: ContainerStatus::Created,
            created: Utc::now(),
        }
    }

    /// Whether removal deletes anonymous volumes.
    #[must_use]
    pub fn removes_anonymous(&self, remove_volumes: bool) -> bool {
        self.auto_remove || remove_volumes
    }
}
