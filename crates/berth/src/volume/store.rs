//! Mount reference store.
//!
//! The store is the single source of truth for volume identity, backing
//! location and reference sets. Each volume lives in its own slot behind a
//! `parking_lot::Mutex`; the slots themselves sit in a sharded `DashMap`,
//! so mutations on unrelated volumes never contend and listings only take
//! each slot lock for the duration of a clone.
//!
//! Lock order is always slot, then map shard. Code paths that look a slot
//! up release the shard guard before locking the slot.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use berth_common::{BerthError, BerthPaths, BerthResult, ContainerId, VolumeId};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};

use super::driver::{LocalDriver, VolumeDriver};
use super::record::{VolumeKind, VolumeRecord, VolumeState};
use crate::runtime::events::{self, EventBus, RuntimeEvent};

#[derive(Debug)]
enum Slot {
    /// Reserved in the map, storage not yet allocated.
    Pending,
    Live(VolumeRecord),
    /// Deleted; holders of a stale handle must look the volume up again.
    Gone,
}

type SlotHandle = Arc<Mutex<Slot>>;

/// Options applied when a volume is first allocated.
#[derive(Debug, Clone, Default)]
pub struct VolumeOptions {
    /// Labels recorded on the volume.
    pub labels: BTreeMap<String, String>,
    /// Hand deletion of an anonymous volume to the lifecycle collector.
    pub auto_remove: bool,
}

/// Result of acquiring a named volume.
#[derive(Debug, Clone)]
pub struct Acquired {
    /// The record after the reference was taken.
    pub record: VolumeRecord,
    /// Whether this call allocated the volume.
    pub created: bool,
}

/// Persistent map from volume identity to storage and referencing containers.
#[derive(Debug)]
pub struct MountReferenceStore {
    paths: BerthPaths,
    driver: Arc<dyn VolumeDriver>,
    events: EventBus,
    volumes: DashMap<VolumeId, SlotHandle>,
}

impl MountReferenceStore {
    /// Open the store under `paths`, loading persisted records.
    pub fn open(paths: BerthPaths, events: EventBus) -> BerthResult<Self> {
        Self::with_driver(paths, Arc::new(LocalDriver), events)
    }

    /// Open the store with a specific volume driver.
    pub fn with_driver(
        paths: BerthPaths,
        driver: Arc<dyn VolumeDriver>,
        events: EventBus,
    ) -> BerthResult<Self> {
        let volumes_dir = paths.volumes();
        fs::create_dir_all(&volumes_dir).map_err(|e| BerthError::storage(&volumes_dir, e))?;

        let store = Self {
            paths,
            driver,
            events,
            volumes: DashMap::new(),
        };
        store.load()?;
        Ok(store)
    }

    /// Paths this store persists under.
    pub fn paths(&self) -> &BerthPaths {
        &self.paths
    }

    /// Bus on which volume events are published.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn load(&self) -> BerthResult<()> {
        for entry in fs::read_dir(self.paths.volumes())? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }

            let record_path = entry.path().join("record.json");
            if !record_path.exists() {
                continue;
            }

            match VolumeRecord::load(&record_path) {
                Ok(record) => {
                    self.volumes
                        .insert(record.id.clone(), Arc::new(Mutex::new(Slot::Live(record))));
                }
                Err(e) => {
                    tracing::warn!(
                        path = %record_path.display(),
                        error = %e,
                        "Skipping unreadable volume record"
                    );
                }
            }
        }

        tracing::debug!(count = self.volumes.len(), "Loaded existing volumes");
        Ok(())
    }

    fn slot(&self, id: &VolumeId) -> Option<SlotHandle> {
        self.volumes.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn forget(&self, id: &VolumeId, slot: &SlotHandle) {
        self.volumes.remove_if(id, |_, current| Arc::ptr_eq(current, slot));
    }

    fn not_found(id: &VolumeId) -> BerthError {
        BerthError::VolumeNotFound {
            name: id.to_string(),
        }
    }

    /// Look up a volume by identity.
    pub fn get(&self, id: &VolumeId) -> Option<VolumeRecord> {
        let slot = self.slot(id)?;
        let guard = slot.lock();
        match &*guard {
            Slot::Live(record) => Some(record.clone()),
            Slot::Pending | Slot::Gone => None,
        }
    }

    /// Create a volume.
    ///
    /// With a name this is get-or-create: an existing named volume is
    /// returned unchanged. Without a name a fresh anonymous volume is
    /// allocated.
    pub fn create(&self, id: Option<&VolumeId>, options: &VolumeOptions) -> BerthResult<VolumeRecord> {
        match id {
            Some(id) => self.acquire_named(id, None, options).map(|a| a.record),
            None => self.create_anonymous(None, options),
        }
    }

    /// Get or create a named volume, optionally taking a reference on it in
    /// the same critical section.
    pub fn acquire_named(
        &self,
        id: &VolumeId,
        holder: Option<&ContainerId>,
        options: &VolumeOptions,
    ) -> BerthResult<Acquired> {
        loop {
            let slot = self
                .volumes
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Slot::Pending)))
                .clone();
            let mut guard = slot.lock();

            let mut created = false;
            if matches!(*guard, Slot::Pending) {
                match self.allocate(id, VolumeKind::Named, options, holder) {
                    Ok(record) => {
                        *guard = Slot::Live(record);
                        created = true;
                    }
                    Err(e) => {
                        *guard = Slot::Gone;
                        self.forget(id, &slot);
                        return Err(e);
                    }
                }
            }

            let Slot::Live(record) = &mut *guard else {
                // Deleted while we waited for the lock.
                continue;
            };

            if !created {
                if let Some(container) = holder {
                    self.add_ref_locked(record, container)?;
                }
            }

            return Ok(Acquired {
                record: record.clone(),
                created,
            });
        }
    }

    /// Allocate a fresh anonymous volume, optionally already referenced by
    /// `holder`.
    pub fn create_anonymous(
        &self,
        holder: Option<&ContainerId>,
        options: &VolumeOptions,
    ) -> BerthResult<VolumeRecord> {
        let id = VolumeId::generate();
        let slot: SlotHandle = Arc::new(Mutex::new(Slot::Pending));
        let mut guard = slot.lock();
        self.volumes.insert(id.clone(), Arc::clone(&slot));

        match self.allocate(&id, VolumeKind::Anonymous, options, holder) {
            Ok(record) => {
                *guard = Slot::Live(record.clone());
                Ok(record)
            }
            Err(e) => {
                *guard = Slot::Gone;
                self.forget(&id, &slot);
                Err(e)
            }
        }
    }

    fn allocate(
        &self,
        id: &VolumeId,
        kind: VolumeKind,
        options: &VolumeOptions,
        holder: Option<&ContainerId>,
    ) -> BerthResult<VolumeRecord> {
        let data = self.paths.volume_data(id.as_str());
        self.driver
            .allocate(&data)
            .map_err(|e| BerthError::storage(&data, e))?;

        let record = VolumeRecord {
            id: id.clone(),
            kind,
            driver: self.driver.name().to_string(),
            mountpoint: data.clone(),
            created: chrono::Utc::now(),
            labels: options.labels.clone(),
            refs: holder.into_iter().cloned().collect(),
            auto_remove: kind == VolumeKind::Anonymous && options.auto_remove,
        };

        if let Err(e) = record.save(&self.paths.volume_record(id.as_str())) {
            if let Err(cleanup) = self.driver.destroy(&data) {
                tracing::warn!(volume = %id, error = %cleanup, "Failed to release storage after failed allocation");
            }
            let _ = fs::remove_dir_all(self.paths.volume(id.as_str()));
            return Err(e);
        }

        tracing::info!(volume = %id, %kind, path = %data.display(), "Volume created");
        self.events.publish(RuntimeEvent::VolumeCreated {
            volume: id.to_string(),
            timestamp: events::now(),
        });

        if let Some(container) = holder {
            self.publish_mounted(id, container);
        }

        Ok(record)
    }

    /// Record that `container` references volume `id`.
    ///
    /// Adding a reference the container already holds is a no-op. Returns the
    /// new reference count.
    pub fn add_ref(&self, id: &VolumeId, container: &ContainerId) -> BerthResult<usize> {
        let slot = self.slot(id).ok_or_else(|| Self::not_found(id))?;
        let mut guard = slot.lock();
        match &mut *guard {
            Slot::Live(record) => self.add_ref_locked(record, container),
            Slot::Pending | Slot::Gone => Err(Self::not_found(id)),
        }
    }

    fn add_ref_locked(&self, record: &mut VolumeRecord, container: &ContainerId) -> BerthResult<usize> {
        if !record.refs.insert(container.clone()) {
            return Ok(record.ref_count());
        }

        if let Err(e) = record.save(&self.paths.volume_record(record.id.as_str())) {
            record.refs.remove(container);
            return Err(e);
        }

        tracing::debug!(volume = %record.id, container = %container, refs = record.ref_count(), "Reference added");
        self.publish_mounted(&record.id, container);
        Ok(record.ref_count())
    }

    fn publish_mounted(&self, id: &VolumeId, container: &ContainerId) {
        self.events.publish(RuntimeEvent::VolumeMounted {
            volume: id.to_string(),
            container: container.to_string(),
            timestamp: events::now(),
        });
    }

    /// Drop `container`'s reference on volume `id`.
    ///
    /// Releasing a reference the container does not hold is a no-op. Returns
    /// the new reference count.
    pub fn remove_ref(&self, id: &VolumeId, container: &ContainerId) -> BerthResult<usize> {
        let slot = self.slot(id).ok_or_else(|| Self::not_found(id))?;
        let mut guard = slot.lock();
        let Slot::Live(record) = &mut *guard else {
            return Err(Self::not_found(id));
        };

        if !record.refs.remove(container) {
            return Ok(record.ref_count());
        }

        if let Err(e) = record.save(&self.paths.volume_record(id.as_str())) {
            record.refs.insert(container.clone());
            return Err(e);
        }

        tracing::debug!(volume = %id, container = %container, refs = record.ref_count(), "Reference released");
        self.events.publish(RuntimeEvent::VolumeUnmounted {
            volume: id.to_string(),
            container: container.to_string(),
            timestamp: events::now(),
        });
        Ok(record.ref_count())
    }

    /// Delete a volume on explicit request.
    ///
    /// # Errors
    ///
    /// [`BerthError::VolumeInUse`] while any container references the volume,
    /// [`BerthError::VolumeNotFound`] if it does not exist, and
    /// [`BerthError::BackingStorageFailure`] if storage cannot be deleted (the
    /// record is kept in that case).
    pub fn remove(&self, id: &VolumeId) -> BerthResult<VolumeRecord> {
        let slot = self.slot(id).ok_or_else(|| Self::not_found(id))?;
        let mut guard = slot.lock();
        let Slot::Live(record) = &*guard else {
            return Err(Self::not_found(id));
        };

        if record.state() == VolumeState::Referenced {
            return Err(BerthError::VolumeInUse {
                name: id.to_string(),
                containers: record.ref_names(),
            });
        }

        self.destroy_locked(id, &slot, &mut guard)
    }

    /// Delete a volume if it is unreferenced and `predicate` accepts it.
    ///
    /// Returns `Ok(None)` when the volume is gone, referenced, or rejected.
    pub fn remove_if_unreferenced(
        &self,
        id: &VolumeId,
        predicate: impl FnOnce(&VolumeRecord) -> bool,
    ) -> BerthResult<Option<VolumeRecord>> {
        let Some(slot) = self.slot(id) else {
            return Ok(None);
        };
        let mut guard = slot.lock();
        let Slot::Live(record) = &*guard else {
            return Ok(None);
        };

        if record.state() == VolumeState::Referenced || !predicate(record) {
            return Ok(None);
        }

        self.destroy_locked(id, &slot, &mut guard).map(Some)
    }

    fn destroy_locked(
        &self,
        id: &VolumeId,
        slot: &SlotHandle,
        guard: &mut MutexGuard<'_, Slot>,
    ) -> BerthResult<VolumeRecord> {
        let Slot::Live(record) = &**guard else {
            return Err(Self::not_found(id));
        };
        let record = record.clone();

        self.driver
            .destroy(&record.mountpoint)
            .map_err(|e| BerthError::storage(&record.mountpoint, e))?;

        let dir = self.paths.volume(id.as_str());
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(BerthError::storage(dir, e)),
        }

        **guard = Slot::Gone;
        self.forget(id, slot);

        tracing::info!(volume = %id, kind = %record.kind, "Volume removed");
        self.events.publish(RuntimeEvent::VolumeDestroyed {
            volume: id.to_string(),
            timestamp: events::now(),
        });
        Ok(record)
    }

    /// Set or clear the collector's claim on an anonymous volume.
    pub fn set_auto_remove(&self, id: &VolumeId, auto_remove: bool) -> BerthResult<()> {
        let slot = self.slot(id).ok_or_else(|| Self::not_found(id))?;
        let mut guard = slot.lock();
        let Slot::Live(record) = &mut *guard else {
            return Err(Self::not_found(id));
        };

        if record.auto_remove != auto_remove {
            let previous = record.auto_remove;
            record.auto_remove = auto_remove;
            if let Err(e) = record.save(&self.paths.volume_record(id.as_str())) {
                record.auto_remove = previous;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Snapshot of every live volume, ordered by identity.
    pub fn list(&self) -> Vec<VolumeRecord> {
        let slots: Vec<SlotHandle> = self
            .volumes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut records: Vec<VolumeRecord> = slots
            .iter()
            .filter_map(|slot| match &*slot.lock() {
                Slot::Live(record) => Some(record.clone()),
                Slot::Pending | Slot::Gone => None,
            })
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Number of live volumes.
    pub fn len(&self) -> usize {
        self.list().len()
    }

    /// Whether the store holds no volumes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist every live record.
    pub fn flush(&self) -> BerthResult<()> {
        for record in self.list() {
            record.save(&self.paths.volume_record(record.id.as_str()))?;
        }
        tracing::debug!("Volume records flushed");
        Ok(())
    }
}
