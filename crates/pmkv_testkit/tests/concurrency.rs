//! Many threads over one store.

use pmkv_core::{EngineKind, MIN_POOL_SIZE};
use pmkv_testkit::prelude::*;
use std::ops::ControlFlow;
use std::thread;

#[test]
fn concurrent_puts_to_distinct_keys_are_all_readable() {
    let config = StressConfig {
        operations: 500,
        threads: 8,
        value_size: 48,
        key_count: 100,
    };
    for kind in ALL_ENGINES {
        let test_store = TestStore::volatile_sized(kind, 8 * MIN_POOL_SIZE);
        let result = stress_concurrent_puts(&test_store, &config);
        assert_eq!(result.failed_ops, 0, "{kind}");
        verify_concurrent_puts(&test_store, &config).unwrap();
        assert_eq!(test_store.count_all().unwrap(), 4000);
        assert_eq!(test_store.verify().unwrap(), 4000);
    }
}

#[test]
fn readers_never_see_torn_values() {
    let config = StressConfig {
        operations: 400,
        threads: 6,
        value_size: 200,
        key_count: 64,
    };
    for kind in ALL_ENGINES {
        let test_store = TestStore::volatile_sized(kind, 4 * MIN_POOL_SIZE);
        let result = stress_mixed_operations(&test_store, &config);
        assert_eq!(result.failed_ops, 0, "{kind}");
        test_store.verify().unwrap();
    }
}

#[test]
fn ordered_scans_stay_sorted_under_writers() {
    for kind in ORDERED_ENGINES {
        let test_store = TestStore::volatile_sized(kind, 4 * MIN_POOL_SIZE);
        for i in 0..600 {
            test_store.put(&key(i * 2), &value(i * 2)).unwrap();
        }
        let store = &test_store.store;

        thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..600 {
                    store.put(&key(i * 2 + 1), &value(i * 2 + 1)).unwrap();
                }
            });
            for _ in 0..3 {
                scope.spawn(|| {
                    for _ in 0..5 {
                        let mut last: Option<Vec<u8>> = None;
                        let mut even = 0;
                        store
                            .get_all(|k, _| {
                                if let Some(prev) = &last {
                                    assert!(prev.as_slice() < k, "scan went backwards");
                                }
                                let i: usize = std::str::from_utf8(&k[3..]).unwrap().parse().unwrap();
                                if i % 2 == 0 {
                                    even += 1;
                                }
                                last = Some(k.to_vec());
                                ControlFlow::Continue(())
                            })
                            .unwrap();
                        // entries present for the whole scan are seen exactly once
                        assert_eq!(even, 600);
                    }
                });
            }
        });
        assert_eq!(test_store.count_all().unwrap(), 1200);
    }
}

#[test]
fn cmap_iteration_sees_every_stable_entry() {
    let test_store = TestStore::volatile_sized(EngineKind::CMap, 4 * MIN_POOL_SIZE);
    for i in 0..500 {
        test_store.put(&key(i), &value(i)).unwrap();
    }
    let store = &test_store.store;
    thread::scope(|scope| {
        scope.spawn(|| {
            for i in 500..1000 {
                store.put(&key(i), &value(i)).unwrap();
            }
        });
        scope.spawn(|| {
            let mut stable = std::collections::HashSet::new();
            store
                .get_all(|k, _| {
                    let i: usize = std::str::from_utf8(&k[3..]).unwrap().parse().unwrap();
                    if i < 500 {
                        stable.insert(i);
                    }
                    ControlFlow::Continue(())
                })
                .unwrap();
            assert_eq!(stable.len(), 500);
        });
    });
}
