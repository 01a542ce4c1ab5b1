//! Reference counting under concurrent container churn.

use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;
use std::thread;

use berth::runtime::{CreateContainer, Engine, EngineConfig, EventBus};
use berth::volume::{ContainerMountSet, MountReferenceStore, VolumeOptions};
use berth_common::{BerthError, BerthPaths, ContainerId, VolumeId};
use proptest::prelude::*;
use tempfile::TempDir;

fn engine(temp: &TempDir) -> Engine {
    fs::create_dir_all(temp.path().join("images/alpine/rootfs")).unwrap();
    Engine::open(EngineConfig::default().with_root(temp.path())).unwrap()
}

fn create(engine: &Engine, id: &str, mounts: &[&str]) -> Result<ContainerId, BerthError> {
    engine.create_container(CreateContainer {
        id: Some(ContainerId::new(id).unwrap()),
        image: "alpine".to_string(),
        mounts: ContainerMountSet::parse(mounts).unwrap(),
        auto_remove: false,
    })
}

#[test_log::test]
fn concurrent_creates_and_removes_keep_exact_count() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 20;

    let temp = TempDir::new().unwrap();
    let engine = Arc::new(engine(&temp));

    thread::scope(|scope| {
        for t in 0..THREADS {
            let engine = Arc::clone(&engine);
            scope.spawn(move || {
                for i in 0..PER_THREAD {
                    let id = create(&engine, &format!("c{t}-{i}"), &["shared:/data", "/tmp/x"]).unwrap();
                    // Remove every other container again.
                    if i % 2 == 0 {
                        engine.remove_container(&id, true).unwrap();
                    }
                }
            });
        }
    });

    let created = THREADS * PER_THREAD;
    let removed = THREADS * PER_THREAD / 2;
    let shared = engine.inspect_volume("shared").unwrap();
    assert_eq!(shared.ref_count(), created - removed);
    assert_eq!(engine.list_containers().len(), created - removed);

    // Every surviving container still owns exactly one anonymous volume.
    assert_eq!(engine.list_volumes().len(), 1 + created - removed);
}

#[test_log::test]
fn volume_removal_racing_creation_never_strands_a_reference() {
    let temp = TempDir::new().unwrap();
    let engine = Arc::new(engine(&temp));

    thread::scope(|scope| {
        for t in 0..4 {
            let engine = Arc::clone(&engine);
            scope.spawn(move || {
                for i in 0..25 {
                    let id = create(&engine, &format!("w{t}-{i}"), &["contested:/data"]).unwrap();
                    engine.remove_container(&id, false).unwrap();
                }
            });
        }
        let remover = Arc::clone(&engine);
        scope.spawn(move || {
            for _ in 0..200 {
                match remover.remove_volume("contested") {
                    Ok(())
                    | Err(BerthError::VolumeInUse { .. } | BerthError::VolumeNotFound { .. }) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        });
    });

    assert!(engine.list_containers().is_empty());
    if let Ok(record) = engine.inspect_volume("contested") {
        assert_eq!(record.ref_count(), 0);
        assert!(record.mountpoint.is_dir());
    }
}

#[derive(Debug, Clone)]
enum Op {
    Add(u8),
    Remove(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![(0u8..4).prop_map(Op::Add), (0u8..4).prop_map(Op::Remove)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn ref_count_matches_distinct_holders(ops in prop::collection::vec(op(), 1..40)) {
        let temp = TempDir::new().unwrap();
        let store = MountReferenceStore::open(BerthPaths::with_root(temp.path()), EventBus::new()).unwrap();
        let id = VolumeId::named("data").unwrap();
        store.create(Some(&id), &VolumeOptions::default()).unwrap();

        let mut model = BTreeSet::new();
        for op in ops {
            let count = match op {
                Op::Add(n) => {
                    model.insert(n);
                    store.add_ref(&id, &ContainerId::new(format!("c{n}")).unwrap()).unwrap()
                }
                Op::Remove(n) => {
                    model.remove(&n);
                    store.remove_ref(&id, &ContainerId::new(format!("c{n}")).unwrap()).unwrap()
                }
            };
            prop_assert_eq!(count, model.len());
        }

        let reopened = MountReferenceStore::open(BerthPaths::with_root(temp.path()), EventBus::new()).unwrap();
        prop_assert_eq!(reopened.get(&id).unwrap().ref_count(), model.len());
    }
}
