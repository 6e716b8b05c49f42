//! Crash simulation across every engine.

use pmkv_core::{CoreError, FailPoint};
use pmkv_testkit::prelude::*;

#[test]
fn fail_points_and_write_sweeps_recover() {
    for kind in ALL_ENGINES {
        let mut harness = CrashRecoveryHarness::new(kind);
        harness.prefill = 32;
        harness.run_all_tests();
        assert!(harness.all_passed(), "{}", harness.summary());
    }
}

#[test]
fn write_sweep_reaches_a_completed_put() {
    let mut harness = CrashRecoveryHarness::new(pmkv_core::EngineKind::STree);
    harness.prefill = 16;
    let tried = harness.sweep_writes(false, 4096);
    assert!(tried < 4096, "put never completed within the write budget");
    assert!(harness.all_passed(), "{}", harness.summary());
}

#[test]
fn committed_remove_survives_crash() {
    for kind in ALL_ENGINES {
        let test_store = scenarios::populated_store(kind, 20);
        assert!(test_store.remove(&key(5)).unwrap());

        let test_store = test_store.crash_and_reopen();
        assert_eq!(test_store.get(&key(5)).unwrap(), None);
        assert_eq!(test_store.count_all().unwrap(), 19);
        assert_eq!(test_store.verify().unwrap(), 19);
    }
}

#[test]
fn interrupted_remove_keeps_the_key() {
    for kind in ALL_ENGINES {
        let test_store = scenarios::populated_store(kind, 20);
        test_store
            .set_fail_point(Some(FailPoint::DuringCommit))
            .unwrap();
        let err = test_store.remove(&key(5)).unwrap_err();
        assert!(is_crash_error(&err));
        assert!(matches!(test_store.count_all(), Err(CoreError::StoreClosed)));

        let test_store = test_store.crash_and_reopen();
        assert_eq!(test_store.get(&key(5)).unwrap(), Some(value(5)));
        assert_eq!(test_store.verify().unwrap(), 20);
    }
}

#[test]
fn file_store_crash_rolls_back() {
    for kind in ALL_ENGINES {
        let test_store = TestStore::file(kind);
        test_store.put(b"kept", b"1").unwrap();
        test_store
            .set_fail_point(Some(FailPoint::BeforeCommit))
            .unwrap();
        assert!(test_store.put(b"kept", b"2").is_err());

        let test_store = test_store.crash_and_reopen();
        assert_eq!(test_store.get(b"kept").unwrap(), Some(b"1".to_vec()));
    }
}
