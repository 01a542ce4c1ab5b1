//! The engine: containers, their volumes, and the operations on both.
//!
//! All operations are synchronous and safe to call from many threads; share
//! the engine through an `Arc`.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use berth_common::{BerthError, BerthResult, ContainerId, VolumeId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::config::EngineConfig;
use super::container::{ContainerRecord, ContainerStatus};
use super::events::{self, EventBus, RuntimeEvent};
use super::state::StateManager;
use crate::volume::{
    CollectionReport, ContainerMountSet, EffectiveView, LifecycleCollector, MountOverlayApplier,
    MountReferenceStore, MountSpec, PruneReport, ResolveOptions, ResolvedMount, VolumeDriver,
    VolumeOptions, VolumeRecord, VolumeResolver, VolumeSummary,
};

/// Request to create a container.
#[derive(Debug, Clone, Default)]
pub struct CreateContainer {
    /// Container ID; generated when absent.
    pub id: Option<ContainerId>,
    /// Image name under the image store, or an absolute rootfs path.
    pub image: String,
    /// Declared mounts.
    pub mounts: ContainerMountSet,
    /// Remove the container and its anonymous volumes once it stops.
    pub auto_remove: bool,
}

#[derive(Debug)]
enum ContainerSlot {
    /// ID reserved while volumes are being resolved.
    Creating,
    Ready(ContainerRecord),
}

/// Volume lifecycle engine.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    events: EventBus,
    store: Arc<MountReferenceStore>,
    resolver: VolumeResolver,
    applier: MountOverlayApplier,
    collector: LifecycleCollector,
    state: StateManager,
    containers: DashMap<ContainerId, ContainerSlot>,
}

impl Engine {
    /// Open the engine, loading persisted state and reconciling it.
    pub fn open(config: EngineConfig) -> BerthResult<Self> {
        let events = EventBus::new();
        let store = MountReferenceStore::open(config.paths.clone(), events.clone())?;
        Self::with_store(config, store, events)
    }

    /// Open the engine with a specific volume driver.
    pub fn with_driver(config: EngineConfig, driver: Arc<dyn VolumeDriver>) -> BerthResult<Self> {
        let events = EventBus::new();
        let store = MountReferenceStore::with_driver(config.paths.clone(), driver, events.clone())?;
        Self::with_store(config, store, events)
    }

    fn with_store(
        config: EngineConfig,
        store: MountReferenceStore,
        events: EventBus,
    ) -> BerthResult<Self> {
        config
            .paths
            .create_dirs()
            .map_err(|e| BerthError::storage(config.paths.root(), e))?;

        let store = Arc::new(store);
        let engine = Self {
            resolver: VolumeResolver::new(Arc::clone(&store)),
            applier: MountOverlayApplier::new(config.copy_image_data),
            collector: LifecycleCollector::new(Arc::clone(&store)),
            state: StateManager::new(config.paths.clone()),
            containers: DashMap::new(),
            store,
            events,
            config,
        };

        engine.load_containers()?;
        engine.reconcile()?;

        tracing::info!(
            root = %engine.config.paths.root().display(),
            rootless = engine.config.rootless,
            containers = engine.containers.len(),
            volumes = engine.store.len(),
            "Engine opened"
        );
        Ok(engine)
    }

    fn load_containers(&self) -> BerthResult<()> {
        for id in self.state.list()? {
            match self.state.load(&id) {
                Ok(record) => {
                    self.containers.insert(record.id.clone(), ContainerSlot::Ready(record));
                }
                Err(e) => {
                    tracing::warn!(container_id = %id, error = %e, "Skipping unreadable container state");
                }
            }
        }
        Ok(())
    }

    /// Drop references held by containers that no longer exist and collect
    /// anonymous volumes left pending auto-removal.
    fn reconcile(&self) -> BerthResult<()> {
        for record in self.store.list() {
            for holder in &record.refs {
                if self.containers.contains_key(holder) {
                    continue;
                }
                tracing::warn!(volume = %record.id, container = %holder, "Dropping reference from missing container");
                self.store.remove_ref(&record.id, holder)?;
            }
        }

        let orphans = self.collector.collect_orphans();
        if !orphans.is_empty() {
            tracing::info!(count = orphans.len(), "Collected orphaned anonymous volumes");
        }
        Ok(())
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bus carrying container and volume events.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The volume reference store.
    pub fn store(&self) -> &MountReferenceStore {
        &self.store
    }

    fn resolve_image(&self, image: &str) -> BerthResult<PathBuf> {
        let not_found = || BerthError::ImageNotFound {
            reference: image.to_string(),
        };

        let path = Path::new(image);
        let rootfs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            let plain = !image.is_empty()
                && path.components().all(|c| matches!(c, Component::Normal(_)));
            if !plain {
                return Err(not_found());
            }
            self.config.paths.image_rootfs(image)
        };

        if rootfs.is_dir() {
            Ok(rootfs)
        } else {
            Err(not_found())
        }
    }

    /// Create a container, resolving its mounts.
    ///
    /// Either the container exists afterwards with every volume referenced,
    /// or nothing changed.
    pub fn create_container(&self, request: CreateContainer) -> BerthResult<ContainerId> {
        let rootfs = self.resolve_image(&request.image)?;
        let id = request.id.unwrap_or_else(ContainerId::generate);

        match self.containers.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(BerthError::ContainerExists { id: id.to_string() });
            }
            // State that failed to load at startup still claims its ID.
            Entry::Vacant(_) if self.state.exists(&id) => {
                return Err(BerthError::ContainerExists { id: id.to_string() });
            }
            Entry::Vacant(slot) => {
                slot.insert(ContainerSlot::Creating);
            }
        }

        let result = self.finish_create(&id, rootfs, request.image, request.mounts, request.auto_remove);
        match result {
            Ok(record) => {
                self.containers.insert(id.clone(), ContainerSlot::Ready(record));
                tracing::info!(container_id = %id, "Container created");
                self.events.publish(RuntimeEvent::ContainerCreated {
                    id: id.to_string(),
                    timestamp: events::now(),
                });
                Ok(id)
            }
            Err(e) => {
                self.containers.remove(&id);
                Err(e)
            }
        }
    }

    fn finish_create(
        &self,
        id: &ContainerId,
        rootfs: PathBuf,
        image: String,
        mounts: ContainerMountSet,
        auto_remove: bool,
    ) -> BerthResult<ContainerRecord> {
        let resolved = self
            .resolver
            .resolve(id, &mounts, ResolveOptions { auto_remove })?;
        let record = ContainerRecord::new(id.clone(), image, rootfs, mounts, resolved, auto_remove);

        if let Err(e) = self.state.save(&record) {
            // The container never existed; hand back what resolution took and
            // discard the anonymous volumes allocated for it.
            let (fresh, shared): (Vec<_>, Vec<_>) = record
                .mounts
                .iter()
                .zip(record.resolved)
                .partition(|(spec, _)| matches!(spec, MountSpec::Anonymous { .. }));
            let fresh: Vec<ResolvedMount> = fresh.into_iter().map(|(_, m)| m).collect();
            let shared: Vec<ResolvedMount> = shared.into_iter().map(|(_, m)| m).collect();
            self.collector.collect(id, &fresh, true);
            self.collector.collect(id, &shared, false);
            return Err(e);
        }
        Ok(record)
    }

    fn record(&self, id: &ContainerId) -> BerthResult<ContainerRecord> {
        match self.containers.get(id).as_deref() {
            Some(ContainerSlot::Ready(record)) => Ok(record.clone()),
            Some(ContainerSlot::Creating) | None => Err(BerthError::ContainerNotFound { id: id.to_string() }),
        }
    }

    fn set_status(&self, id: &ContainerId, status: ContainerStatus) -> BerthResult<()> {
        self.transition(id, status, None)
    }

    /// Move a container to `status`, refusing with `action` unless the
    /// current status satisfies [`ContainerStatus::can_start`].
    fn transition(
        &self,
        id: &ContainerId,
        status: ContainerStatus,
        guarded: Option<&'static str>,
    ) -> BerthResult<()> {
        let mut entry = self
            .containers
            .get_mut(id)
            .ok_or_else(|| BerthError::ContainerNotFound { id: id.to_string() })?;
        let ContainerSlot::Ready(record) = entry.value_mut() else {
            return Err(BerthError::ContainerNotFound { id: id.to_string() });
        };

        let previous = record.status;
        if let Some(action) = guarded {
            if !previous.can_start() {
                return Err(Self::refused(id, action, previous));
            }
        }
        record.status = status;
        if let Err(e) = self.state.save(record) {
            record.status = previous;
            return Err(e);
        }
        Ok(())
    }

    fn refused(id: &ContainerId, action: &'static str, status: ContainerStatus) -> BerthError {
        BerthError::InvalidContainerState {
            id: id.to_string(),
            action,
            status: status.to_string(),
        }
    }

    /// Look up a container.
    pub fn container(&self, id: &ContainerId) -> BerthResult<ContainerRecord> {
        self.record(id)
    }

    /// Start a container: apply its mounts over the image and return the
    /// resulting view.
    ///
    /// Only created or stopped containers start; a running one is refused
    /// with [`BerthError::InvalidContainerState`].
    pub fn start_container(&self, id: &ContainerId) -> BerthResult<EffectiveView> {
        let record = self.record(id)?;
        if !record.status.can_start() {
            return Err(Self::refused(id, "started", record.status));
        }
        let view = self.applier.apply(&record.rootfs, &record.resolved)?;

        self.transition(id, ContainerStatus::Running, Some("started"))?;
        tracing::info!(container_id = %id, "Container started");
        self.events.publish(RuntimeEvent::ContainerStarted {
            id: id.to_string(),
            timestamp: events::now(),
        });
        Ok(view)
    }

    /// Stop a container. An auto-remove container is removed as well.
    ///
    /// Returns the collection report when the container was removed.
    pub fn stop_container(&self, id: &ContainerId) -> BerthResult<Option<CollectionReport>> {
        let record = self.record(id)?;
        self.set_status(id, ContainerStatus::Stopped)?;
        tracing::info!(container_id = %id, "Container stopped");
        self.events.publish(RuntimeEvent::ContainerStopped {
            id: id.to_string(),
            timestamp: events::now(),
        });

        if record.auto_remove {
            return self.remove_container(id, false).map(Some);
        }
        Ok(None)
    }

    /// Remove a container and release its volumes.
    ///
    /// Anonymous volumes reaching zero references are deleted when the
    /// container was created with auto-remove or `remove_volumes` is set.
    /// Named volumes and bind sources are never deleted.
    pub fn remove_container(
        &self,
        id: &ContainerId,
        remove_volumes: bool,
    ) -> BerthResult<CollectionReport> {
        let (_, entry) = self
            .containers
            .remove_if(id, |_, entry| matches!(entry, ContainerSlot::Ready(_)))
            .ok_or_else(|| BerthError::ContainerNotFound { id: id.to_string() })?;
        let ContainerSlot::Ready(record) = entry else {
            return Err(BerthError::Internal {
                message: format!("container {id} claimed while still being created"),
            });
        };

        if let Err(e) = self.state.delete(id) {
            self.containers.insert(id.clone(), ContainerSlot::Ready(record));
            return Err(e);
        }

        let report = self.collector.collect(
            id,
            &record.resolved,
            record.removes_anonymous(remove_volumes),
        );

        tracing::info!(
            container_id = %id,
            deleted_volumes = report.deleted.len(),
            "Container removed"
        );
        self.events.publish(RuntimeEvent::ContainerRemoved {
            id: id.to_string(),
            timestamp: events::now(),
        });
        Ok(report)
    }

    /// All containers, ordered by ID.
    pub fn list_containers(&self) -> Vec<ContainerRecord> {
        let mut records: Vec<ContainerRecord> = self
            .containers
            .iter()
            .filter_map(|entry| match entry.value() {
                ContainerSlot::Ready(record) => Some(record.clone()),
                ContainerSlot::Creating => None,
            })
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    fn volume_id(name: &str) -> VolumeId {
        VolumeId::from_persisted(name.trim())
    }

    /// Summaries of every volume.
    pub fn list_volumes(&self) -> Vec<VolumeSummary> {
        self.store.list().iter().map(VolumeSummary::from).collect()
    }

    /// Full record of one volume.
    pub fn inspect_volume(&self, name: &str) -> BerthResult<VolumeRecord> {
        let id = Self::volume_id(name);
        self.store.get(&id).ok_or_else(|| BerthError::VolumeNotFound {
            name: name.trim().to_string(),
        })
    }

    /// Create a named volume; an existing volume is returned unchanged.
    pub fn create_volume(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> BerthResult<VolumeRecord> {
        let id = VolumeId::named(name)?;
        self.store.create(
            Some(&id),
            &VolumeOptions {
                labels,
                auto_remove: false,
            },
        )
    }

    /// Delete an unreferenced volume.
    pub fn remove_volume(&self, name: &str) -> BerthResult<()> {
        self.store.remove(&Self::volume_id(name)).map(|_| ())
    }

    /// Delete every unreferenced volume not pending auto-removal.
    pub fn prune_volumes(&self) -> PruneReport {
        self.collector.prune()
    }

    /// Persist all state.
    pub fn flush(&self) -> BerthResult<()> {
        self.store.flush()?;
        for record in self.list_containers() {
            self.state.save(&record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_common::BerthPaths;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    use crate::volume::VolumeKind;

    fn engine() -> (TempDir, Engine) {
        let temp = tempdir().unwrap();
        let rootfs = temp.path().join("images/alpine/rootfs");
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        let engine = Engine::open(EngineConfig::default().with_root(temp.path())).unwrap();
        (temp, engine)
    }

    fn create(engine: &Engine, id: &str, mounts: &[&str], auto_remove: bool) -> BerthResult<ContainerId> {
        engine.create_container(CreateContainer {
            id: Some(ContainerId::new(id).unwrap()),
            image: "alpine".to_string(),
            mounts: ContainerMountSet::parse(mounts)?,
            auto_remove,
        })
    }

    #[test]
    fn unknown_image() {
        let (_temp, engine) = engine();
        for image in ["busybox", "../alpine", ""] {
            let result = engine.create_container(CreateContainer {
                image: image.to_string(),
                ..CreateContainer::default()
            });
            assert!(matches!(result, Err(BerthError::ImageNotFound { .. })), "{image}");
        }
    }

    #[test]
    fn duplicate_container_id() {
        let (_temp, engine) = engine();
        create(&engine, "web", &[], false).unwrap();
        assert!(matches!(
            create(&engine, "web", &[], false),
            Err(BerthError::ContainerExists { .. })
        ));
    }

    #[test]
    fn unreadable_state_keeps_its_id_reserved() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join("images/alpine/rootfs")).unwrap();
        let state = BerthPaths::with_root(temp.path()).container_state("web");
        fs::create_dir_all(state.parent().unwrap()).unwrap();
        fs::write(&state, "{ not json").unwrap();

        let engine = Engine::open(EngineConfig::default().with_root(temp.path())).unwrap();
        assert!(engine.list_containers().is_empty());
        assert!(matches!(
            create(&engine, "web", &[], false),
            Err(BerthError::ContainerExists { .. })
        ));
        assert_eq!(fs::read_to_string(&state).unwrap(), "{ not json");
    }

    #[test]
    fn failed_create_leaves_no_container() {
        let (_temp, engine) = engine();
        assert!(create(&engine, "web", &["data:/data", "bad name:/x"], false).is_err());
        assert!(engine.list_containers().is_empty());
        assert!(engine.list_volumes().is_empty());
        create(&engine, "web", &[], false).unwrap();
    }

    #[test]
    fn lifecycle_status() {
        let (_temp, engine) = engine();
        let id = create(&engine, "web", &["data:/data"], false).unwrap();
        assert_eq!(engine.container(&id).unwrap().status, ContainerStatus::Created);

        engine.start_container(&id).unwrap();
        assert_eq!(engine.container(&id).unwrap().status, ContainerStatus::Running);
        assert!(matches!(
            engine.start_container(&id),
            Err(BerthError::InvalidContainerState { action: "started", .. })
        ));

        assert!(engine.stop_container(&id).unwrap().is_none());
        assert_eq!(engine.container(&id).unwrap().status, ContainerStatus::Stopped);
        engine.start_container(&id).unwrap();
    }

    #[test]
    fn stopping_auto_remove_container_removes_it() {
        let (_temp, engine) = engine();
        let id = create(&engine, "job", &["/scratch"], true).unwrap();
        assert_eq!(engine.list_volumes().len(), 1);

        let report = engine.stop_container(&id).unwrap().unwrap();
        assert_eq!(report.deleted.len(), 1);
        assert!(engine.list_containers().is_empty());
        assert!(engine.list_volumes().is_empty());
    }

    #[test]
    fn remove_with_volumes_flag() {
        let (_temp, engine) = engine();
        let a = create(&engine, "a", &["/scratch", "data:/data"], false).unwrap();
        let b = create(&engine, "b", &["/scratch"], false).unwrap();

        engine.remove_container(&a, false).unwrap();
        let anonymous = engine
            .list_volumes()
            .into_iter()
            .filter(|v| v.kind == VolumeKind::Anonymous)
            .count();
        assert_eq!(anonymous, 2);

        let report = engine.remove_container(&b, true).unwrap();
        assert_eq!(report.deleted.len(), 1);
        assert!(matches!(
            engine.remove_container(&b, true),
            Err(BerthError::ContainerNotFound { .. })
        ));
    }

    #[test]
    fn removal_survives_unreleasable_reference() {
        let (temp, engine) = engine();
        let id = create(&engine, "web", &["stuck:/stuck", "data:/data"], false).unwrap();

        let record = BerthPaths::with_root(temp.path()).volume_record("stuck");
        fs::remove_file(&record).unwrap();
        fs::create_dir_all(record.join("blocker")).unwrap();

        let report = engine.remove_container(&id, false).unwrap();
        assert_eq!(report.retained, vec![VolumeId::named("stuck").unwrap()]);
        assert_eq!(report.released, vec![VolumeId::named("data").unwrap()]);
        assert!(engine.list_containers().is_empty());
        assert_eq!(engine.inspect_volume("data").unwrap().ref_count(), 0);
    }

    #[test]
    fn volume_commands() {
        let (_temp, engine) = engine();
        let mut labels = BTreeMap::new();
        labels.insert("team".to_string(), "web".to_string());

        let record = engine.create_volume("cache", labels).unwrap();
        assert_eq!(record.labels["team"], "web");
        assert_eq!(engine.inspect_volume(" cache ").unwrap().id, record.id);

        engine.remove_volume("cache").unwrap();
        assert!(matches!(
            engine.inspect_volume("cache"),
            Err(BerthError::VolumeNotFound { .. })
        ));
        assert!(matches!(
            engine.remove_volume("cache"),
            Err(BerthError::VolumeNotFound { .. })
        ));
    }

    #[test]
    fn state_survives_reopen() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join("images/alpine/rootfs")).unwrap();
        let config = EngineConfig::default().with_root(temp.path());

        {
            let engine = Engine::open(config.clone()).unwrap();
            create(&engine, "web", &["data:/data"], false).unwrap();
            engine.flush().unwrap();
        }

        let engine = Engine::open(config).unwrap();
        let containers = engine.list_containers();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].resolved.len(), 1);
        assert_eq!(engine.inspect_volume("data").unwrap().ref_count(), 1);
    }

    #[test]
    fn reopen_drops_references_of_vanished_containers() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join("images/alpine/rootfs")).unwrap();
        let config = EngineConfig::default().with_root(temp.path());

        {
            let engine = Engine::open(config.clone()).unwrap();
            create(&engine, "gone", &["data:/data", "/tmp/work"], true).unwrap();
        }
        fs::remove_dir_all(config.paths.container("gone")).unwrap();

        let engine = Engine::open(config).unwrap();
        let volumes = engine.list_volumes();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].id.as_str(), "data");
        assert_eq!(volumes[0].ref_count, 0);
    }

    #[test]
    fn absolute_rootfs_paths_are_images() {
        let (temp, engine) = engine();
        let rootfs = temp.path().join("images/alpine/rootfs");
        let id = engine
            .create_container(CreateContainer {
                image: rootfs.display().to_string(),
                ..CreateContainer::default()
            })
            .unwrap();
        assert_eq!(engine.container(&id).unwrap().rootfs, rootfs);
    }
}
