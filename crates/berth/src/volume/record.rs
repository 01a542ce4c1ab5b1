//! Volume records and their on-disk form.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use berth_common::{BerthError, BerthResult, ContainerId, VolumeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a volume came to exist, which decides who may delete it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    /// User-named volume; deleted only on explicit request.
    Named,
    /// Volume with a generated identity, owned by the container that created it.
    Anonymous,
}

impl fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named => write!(f, "named"),
            Self::Anonymous => write!(f, "anonymous"),
        }
    }
}

/// Reference state of a live volume record.
///
/// `Deleted` is not represented: a deleted volume has no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    /// No container mounts the volume.
    Unreferenced,
    /// At least one container mounts the volume.
    Referenced,
}

/// A tracked volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    /// Volume identity (name or generated ID).
    pub id: VolumeId,
    /// Named or anonymous.
    pub kind: VolumeKind,
    /// Driver that owns the backing storage.
    pub driver: String,
    /// Backing storage location, fixed at allocation.
    pub mountpoint: PathBuf,
    /// Creation timestamp.
    pub created: DateTime<Utc>,
    /// Volume labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Containers currently referencing the volume.
    #[serde(default)]
    pub refs: BTreeSet<ContainerId>,
    /// Anonymous volume whose deletion is still owned by the collector.
    #[serde(default)]
    pub auto_remove: bool,
}

impl VolumeRecord {
    /// Number of containers referencing this volume.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.refs.len()
    }

    /// Current reference state.
    #[must_use]
    pub fn state(&self) -> VolumeState {
        if self.refs.is_empty() {
            VolumeState::Unreferenced
        } else {
            VolumeState::Referenced
        }
    }

    /// Whether prune may delete this record right now.
    #[must_use]
    pub fn is_prunable(&self) -> bool {
        self.state() == VolumeState::Unreferenced
            && !(self.kind == VolumeKind::Anonymous && self.auto_remove)
    }

    /// Referencing container IDs as plain strings.
    #[must_use]
    pub fn ref_names(&self) -> Vec<String> {
        self.refs.iter().map(ToString::to_string).collect()
    }

    /// Read a persisted record.
    pub fn load(path: &Path) -> BerthResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Persist the record, replacing any previous copy atomically.
    pub fn save(&self, path: &Path) -> BerthResult<()> {
        let dir = path.parent().ok_or_else(|| BerthError::Internal {
            message: format!("record path {} has no parent", path.display()),
        })?;
        std::fs::create_dir_all(dir).map_err(|e| BerthError::storage(dir, e))?;

        let json = serde_json::to_vec_pretty(self)?;
        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| BerthError::storage(dir, e))?;
        tmp.write_all(&json)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| BerthError::storage(tmp.path(), e))?;
        tmp.persist(path)
            .map_err(|e| BerthError::storage(path, e.error))?;

        Ok(())
    }
}

/// Summary row for volume listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSummary {
    /// Volume identity.
    pub id: VolumeId,
    /// Named or anonymous.
    pub kind: VolumeKind,
    /// Number of referencing containers.
    pub ref_count: usize,
}

impl From<&VolumeRecord> for VolumeSummary {
    fn from(record: &VolumeRecord) -> Self {
        Self {
            id: record.id.clone(),
            kind: record.kind,
            ref_count: record.ref_count(),
        }
    }
}
