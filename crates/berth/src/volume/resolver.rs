//! Volume resolver.
//!
//! Turns a container's declared mounts into concrete host paths. Every spec
//! is validated before the store is touched; mutations are then recorded in
//! a compensation log that is unwound if any later step fails, so a failed
//! resolution leaves no references or anonymous volumes behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use berth_common::{BerthError, BerthResult, ContainerId, VolumeId};

use super::record::VolumeKind;
use super::spec::{
    normalize_container_path, normalize_target, ContainerMountSet, MountSource, MountSpec,
    ResolvedMount,
};
use super::store::{MountReferenceStore, VolumeOptions};

/// Per-request resolution options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// The container was created with auto-remove semantics.
    pub auto_remove: bool,
}

/// A spec that passed validation.
#[derive(Debug)]
enum Planned {
    Named {
        id: VolumeId,
        target: PathBuf,
        read_only: bool,
    },
    Anonymous {
        target: PathBuf,
    },
    Bind {
        host_path: PathBuf,
        target: PathBuf,
        read_only: bool,
    },
}

#[derive(Debug)]
enum Undo {
    /// Drop the reference taken on an existing volume.
    Release(VolumeId),
    /// Drop the reference and delete the volume this request allocated.
    Discard(VolumeId),
}

/// Compensation log; unwinds on drop unless committed.
struct Compensation<'a> {
    store: &'a MountReferenceStore,
    container: &'a ContainerId,
    undo: Vec<Undo>,
    committed: bool,
}

impl<'a> Compensation<'a> {
    fn new(store: &'a MountReferenceStore, container: &'a ContainerId) -> Self {
        Self {
            store,
            container,
            undo: Vec::new(),
            committed: false,
        }
    }

    fn push(&mut self, undo: Undo) {
        self.undo.push(undo);
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Compensation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        for undo in self.undo.drain(..).rev() {
            let (id, discard) = match &undo {
                Undo::Release(id) => (id, false),
                Undo::Discard(id) => (id, true),
            };

            if let Err(e) = self.store.remove_ref(id, self.container) {
                tracing::warn!(volume = %id, container = %self.container, error = %e, "Rollback failed to release reference");
                continue;
            }
            if discard {
                if let Err(e) = self.store.remove_if_unreferenced(id, |_| true) {
                    tracing::warn!(volume = %id, error = %e, "Rollback failed to delete volume");
                }
            }
            tracing::debug!(volume = %id, container = %self.container, "Rolled back volume reference");
        }
    }
}

/// Resolves container mount sets against the reference store.
#[derive(Debug, Clone)]
pub struct VolumeResolver {
    store: Arc<MountReferenceStore>,
}

impl VolumeResolver {
    /// Create a resolver over `store`.
    pub fn new(store: Arc<MountReferenceStore>) -> Self {
        Self { store }
    }

    /// Resolve every spec of `mounts` for `container`, atomically.
    ///
    /// On success each named and anonymous volume holds a reference for
    /// `container`. On failure nothing is left referenced or allocated.
    pub fn resolve(
        &self,
        container: &ContainerId,
        mounts: &ContainerMountSet,
        options: ResolveOptions,
    ) -> BerthResult<Vec<ResolvedMount>> {
        let planned = mounts
            .iter()
            .map(validate)
            .collect::<BerthResult<Vec<_>>>()?;

        let mut log = Compensation::new(&self.store, container);
        let mut resolved = Vec::with_capacity(planned.len());

        for plan in planned {
            resolved.push(self.apply(container, plan, options, &mut log)?);
        }

        log.commit();
        tracing::info!(
            container = %container,
            mounts = resolved.len(),
            "Resolved container mounts"
        );
        Ok(resolved)
    }

    fn apply(
        &self,
        container: &ContainerId,
        plan: Planned,
        options: ResolveOptions,
        log: &mut Compensation<'_>,
    ) -> BerthResult<ResolvedMount> {
        match plan {
            Planned::Named {
                id,
                target,
                read_only,
            } => {
                let acquired =
                    self.store
                        .acquire_named(&id, Some(container), &VolumeOptions::default())?;
                log.push(if acquired.created {
                    Undo::Discard(id.clone())
                } else {
                    Undo::Release(id.clone())
                });

                // A name may address an anonymous volume by its generated ID.
                Ok(ResolvedMount {
                    source: MountSource::Volume {
                        id,
                        kind: acquired.record.kind,
                    },
                    host_path: acquired.record.mountpoint,
                    target,
                    read_only,
                })
            }
            Planned::Anonymous { target } => {
                let record = self.store.create_anonymous(
                    Some(container),
                    &VolumeOptions {
                        auto_remove: options.auto_remove,
                        ..Default::default()
                    },
                )?;
                log.push(Undo::Discard(record.id.clone()));

                Ok(ResolvedMount {
                    source: MountSource::Volume {
                        id: record.id,
                        kind: VolumeKind::Anonymous,
                    },
                    host_path: record.mountpoint,
                    target,
                    read_only: false,
                })
            }
            Planned::Bind {
                host_path,
                target,
                read_only,
            } => {
                if !host_path.exists() {
                    std::fs::create_dir_all(&host_path)
                        .map_err(|e| BerthError::storage(&host_path, e))?;
                    tracing::debug!(path = %host_path.display(), "Created missing bind source");
                }

                Ok(ResolvedMount {
                    source: MountSource::Bind,
                    host_path,
                    target,
                    read_only,
                })
            }
        }
    }
}

fn validate(spec: &MountSpec) -> BerthResult<Planned> {
    let target = normalize_target(spec)?;

    match spec {
        MountSpec::Named {
            name, read_only, ..
        } => {
            let id = VolumeId::named(name).map_err(|e| match e {
                BerthError::InvalidMountSpec { reason, .. } => {
                    BerthError::invalid_spec(spec.to_string(), reason)
                }
                other => other,
            })?;
            Ok(Planned::Named {
                id,
                target,
                read_only: *read_only,
            })
        }
        MountSpec::Anonymous { .. } => Ok(Planned::Anonymous { target }),
        MountSpec::Bind(bind) => {
            if !bind.host_path.is_absolute() {
                return Err(BerthError::invalid_spec(
                    spec.to_string(),
                    "bind source must be an absolute host path",
                ));
            }
            let host_path = normalize_container_path(&bind.host_path)
                .map_err(|reason| BerthError::invalid_spec(spec.to_string(), reason))?;
            check_creatable(&host_path)
                .map_err(|reason| BerthError::invalid_spec(spec.to_string(), reason))?;

            Ok(Planned::Bind {
                host_path,
                target,
                read_only: bind.read_only,
            })
        }
    }
}

/// A bind source must exist, or its nearest existing ancestor must be a
/// directory so that it can be created.
fn check_creatable(path: &Path) -> Result<(), String> {
    if path.exists() {
        return Ok(());
    }

    match path.ancestors().skip(1).find(|p| p.exists()) {
        Some(ancestor) if ancestor.is_dir() => Ok(()),
        Some(ancestor) => Err(format!(
            "cannot create '{}': '{}' is not a directory",
            path.display(),
            ancestor.display()
        )),
        None => Err(format!("cannot create '{}'", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::EventBus;
    use crate::volume::driver::testing::FlakyDriver;
    use berth_common::BerthPaths;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        temp: TempDir,
        store: Arc<MountReferenceStore>,
        resolver: VolumeResolver,
    }

    fn fixture() -> Fixture {
        let temp = tempdir().unwrap();
        let store = Arc::new(
            MountReferenceStore::open(BerthPaths::with_root(temp.path().join("root")), EventBus::new())
                .unwrap(),
        );
        let resolver = VolumeResolver::new(Arc::clone(&store));
        Fixture {
            temp,
            store,
            resolver,
        }
    }

    fn cid(id: &str) -> ContainerId {
        ContainerId::new(id).unwrap()
    }

    #[test]
    fn resolves_all_kinds_in_order() {
        let fx = fixture();
        let host = fx.temp.path().join("src");
        std::fs::create_dir(&host).unwrap();

        let mounts = ContainerMountSet::parse(&[
            format!("{}:/app:ro", host.display()),
            "/app/node_modules".to_string(),
            "feedback:/app/feedback".to_string(),
        ])
        .unwrap();

        let resolved = fx
            .resolver
            .resolve(&cid("web"), &mounts, ResolveOptions::default())
            .unwrap();

        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved[0].source, MountSource::Bind);
        assert_eq!(resolved[0].host_path, host);
        assert!(resolved[0].read_only);
        assert!(matches!(
            resolved[1].volume(),
            Some((_, VolumeKind::Anonymous))
        ));
        assert_eq!(resolved[2].target, PathBuf::from("/app/feedback"));

        let feedback = fx.store.get(&VolumeId::named("feedback").unwrap()).unwrap();
        assert_eq!(feedback.ref_count(), 1);
        assert_eq!(resolved[2].host_path, feedback.mountpoint);
    }

    #[test]
    fn same_named_volume_resolves_to_same_location() {
        let fx = fixture();
        let mounts = ContainerMountSet::parse(&["data:/data"]).unwrap();

        let a = fx
            .resolver
            .resolve(&cid("a"), &mounts, ResolveOptions::default())
            .unwrap();
        let b = fx
            .resolver
            .resolve(&cid("b"), &mounts, ResolveOptions::default())
            .unwrap();

        assert_eq!(a[0].host_path, b[0].host_path);
        let record = fx.store.get(&VolumeId::named("data").unwrap()).unwrap();
        assert_eq!(record.ref_count(), 2);
    }

    #[test]
    fn invalid_spec_fails_before_any_mutation() {
        let fx = fixture();
        let mounts = ContainerMountSet::parse(&["data:/data", "/cache", "relative/target"]).unwrap();

        let err = fx
            .resolver
            .resolve(&cid("web"), &mounts, ResolveOptions::default())
            .unwrap_err();

        assert!(matches!(err, BerthError::InvalidMountSpec { .. }));
        assert!(fx.store.is_empty());
    }

    #[test]
    fn rejects_bad_specs() {
        let fx = fixture();
        let file = fx.temp.path().join("file");
        std::fs::write(&file, "x").unwrap();

        let bad = [
            "./src:/app".to_string(),
            "-bad:/data".to_string(),
            "data:/".to_string(),
            format!("{}/sub:/app", file.display()),
        ];
        for spec in bad {
            let mounts = ContainerMountSet::parse(&[spec.as_str()]).unwrap();
            let err = fx
                .resolver
                .resolve(&cid("web"), &mounts, ResolveOptions::default())
                .unwrap_err();
            assert!(
                matches!(err, BerthError::InvalidMountSpec { .. }),
                "{spec} should be invalid, got {err}"
            );
        }
    }

    #[test]
    fn storage_failure_rolls_back_earlier_mounts() {
        let temp = tempdir().unwrap();
        let driver = Arc::new(FlakyDriver::default());
        let store = Arc::new(
            MountReferenceStore::with_driver(
                BerthPaths::with_root(temp.path()),
                driver.clone(),
                EventBus::new(),
            )
            .unwrap(),
        );
        let resolver = VolumeResolver::new(Arc::clone(&store));
        store
            .create(Some(&VolumeId::named("shared").unwrap()), &VolumeOptions::default())
            .unwrap();

        // "fresh" is allocated, the anonymous volume is not.
        driver.fail_allocate_after(1);
        let mounts = ContainerMountSet::parse(&["shared:/shared", "fresh:/fresh", "/anon"]).unwrap();

        let err = resolver
            .resolve(&cid("web"), &mounts, ResolveOptions::default())
            .unwrap_err();
        assert!(matches!(err, BerthError::BackingStorageFailure { .. }));

        let volumes = store.list();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].id.as_str(), "shared");
        assert_eq!(volumes[0].ref_count(), 0);
        assert!(!store.paths().volume("fresh").exists());
    }

    #[test]
    fn missing_bind_source_is_created() {
        let fx = fixture();
        let host = fx.temp.path().join("new").join("dir");
        let mounts = ContainerMountSet::parse(&[format!("{}:/app", host.display())]).unwrap();

        fx.resolver
            .resolve(&cid("web"), &mounts, ResolveOptions::default())
            .unwrap();
        assert!(host.is_dir());
    }

    #[test]
    fn anonymous_volumes_carry_auto_remove() {
        let fx = fixture();
        let mounts = ContainerMountSet::parse(&["/tmp/cache"]).unwrap();

        let resolved = fx
            .resolver
            .resolve(&cid("web"), &mounts, ResolveOptions { auto_remove: true })
            .unwrap();

        let (id, _) = resolved[0].volume().unwrap();
        assert!(fx.store.get(id).unwrap().auto_remove);
    }

    #[test]
    fn anonymous_volume_addressed_by_id_keeps_its_kind() {
        let fx = fixture();
        let first = fx
            .resolver
            .resolve(&cid("a"), &ContainerMountSet::parse(&["/scratch"]).unwrap(), ResolveOptions::default())
            .unwrap();
        let (id, _) = first[0].volume().unwrap();

        let spec = format!("{id}:/shared");
        let second = fx
            .resolver
            .resolve(&cid("b"), &ContainerMountSet::parse(&[spec]).unwrap(), ResolveOptions::default())
            .unwrap();

        assert_eq!(second[0].volume(), Some((id, VolumeKind::Anonymous)));
        assert_eq!(second[0].host_path, first[0].host_path);
        assert_eq!(fx.store.get(id).unwrap().ref_count(), 2);
    }
}
