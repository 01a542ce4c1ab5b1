//! Lifecycle garbage collector.
//!
//! Releases a removed container's volume references and deletes anonymous
//! volumes that are no longer needed. Named volumes and bind-mounted host
//! paths are never touched.

use std::collections::BTreeSet;
use std::sync::Arc;

use berth_common::{BerthError, ContainerId, VolumeId};
use serde::Serialize;

use super::record::{VolumeKind, VolumeRecord};
use super::spec::ResolvedMount;
use super::store::MountReferenceStore;

/// Outcome of collecting one container's volumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    /// Volumes whose reference from the container was released.
    pub released: Vec<VolumeId>,
    /// Anonymous volumes deleted.
    pub deleted: Vec<VolumeId>,
    /// Eligible volumes whose deletion failed; left for prune.
    pub retained: Vec<VolumeId>,
}

/// Outcome of a prune pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Volumes deleted.
    pub deleted: Vec<VolumeId>,
    /// Volumes that were eligible but could not be deleted.
    pub failed: Vec<VolumeId>,
}

impl PruneReport {
    /// Number of volumes deleted.
    #[must_use]
    pub fn count(&self) -> usize {
        self.deleted.len()
    }
}

/// Deletes volumes once nothing needs them.
#[derive(Debug, Clone)]
pub struct LifecycleCollector {
    store: Arc<MountReferenceStore>,
}

impl LifecycleCollector {
    /// Create a collector over `store`.
    pub fn new(store: Arc<MountReferenceStore>) -> Self {
        Self { store }
    }

    /// Release `container`'s references and delete anonymous volumes that
    /// reach zero references.
    ///
    /// An anonymous volume is deleted when its record carries the
    /// auto-remove claim or `remove_anonymous` is set, whichever container
    /// dropped the last reference and however it was declared.
    ///
    /// Failures never fail the call. A reference that cannot be released is
    /// logged and reported in [`CollectionReport::retained`]; startup
    /// reconciliation drops it later. A volume whose deletion fails is kept,
    /// its `auto_remove` flag is cleared so prune can retry, and it is
    /// reported in `retained` as well.
    pub fn collect(
        &self,
        container: &ContainerId,
        mounts: &[ResolvedMount],
        remove_anonymous: bool,
    ) -> CollectionReport {
        let mut report = CollectionReport::default();
        let mut seen = BTreeSet::new();

        for (id, _) in mounts.iter().filter_map(ResolvedMount::volume) {
            if !seen.insert(id.clone()) {
                continue;
            }

            let remaining = match self.store.remove_ref(id, container) {
                Ok(remaining) => remaining,
                Err(BerthError::VolumeNotFound { .. }) => {
                    tracing::warn!(volume = %id, container = %container, "Volume vanished before release");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(volume = %id, container = %container, error = %e, "Failed to release volume reference");
                    report.retained.push(id.clone());
                    continue;
                }
            };
            report.released.push(id.clone());

            if remaining > 0 {
                continue;
            }

            let eligible = |record: &VolumeRecord| {
                record.kind == VolumeKind::Anonymous && (record.auto_remove || remove_anonymous)
            };
            match self.store.remove_if_unreferenced(id, eligible) {
                Ok(Some(_)) => report.deleted.push(id.clone()),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(volume = %id, error = %e, "Failed to delete anonymous volume; leaving it for prune");
                    if let Err(e) = self.store.set_auto_remove(id, false) {
                        tracing::warn!(volume = %id, error = %e, "Failed to clear auto-remove flag");
                    }
                    report.retained.push(id.clone());
                }
            }
        }

        tracing::debug!(
            container = %container,
            released = report.released.len(),
            deleted = report.deleted.len(),
            retained = report.retained.len(),
            "Collected container volumes"
        );
        report
    }

    /// Delete every unreferenced volume not pending auto-removal.
    pub fn prune(&self) -> PruneReport {
        let mut report = PruneReport::default();

        for record in self.store.list() {
            if !record.is_prunable() {
                continue;
            }
            match self.store.remove_if_unreferenced(&record.id, |r| r.is_prunable()) {
                Ok(Some(_)) => report.deleted.push(record.id),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(volume = %record.id, error = %e, "Failed to prune volume");
                    report.failed.push(record.id);
                }
            }
        }

        tracing::info!(deleted = report.count(), failed = report.failed.len(), "Pruned volumes");
        report
    }

    /// Delete anonymous volumes left pending auto-removal with no references,
    /// as happens when the process dies between release and deletion.
    pub fn collect_orphans(&self) -> Vec<VolumeId> {
        let mut deleted = Vec::new();
        for record in self.store.list() {
            if record.kind != VolumeKind::Anonymous || !record.auto_remove {
                continue;
            }
            let orphaned = |r: &VolumeRecord| r.kind == VolumeKind::Anonymous && r.auto_remove;
            match self.store.remove_if_unreferenced(&record.id, orphaned) {
                Ok(Some(_)) => deleted.push(record.id),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(volume = %record.id, error = %e, "Failed to delete orphaned volume");
                    if let Err(e) = self.store.set_auto_remove(&record.id, false) {
                        tracing::warn!(volume = %record.id, error = %e, "Failed to clear auto-remove flag");
                    }
                }
            }
        }
        deleted
    }
}
