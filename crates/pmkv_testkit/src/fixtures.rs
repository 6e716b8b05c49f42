//! Test fixtures and store helpers.
//!
//! Provides convenience functions for setting up test stores over
//! anonymous memory or temporary pool files, for every engine.

use pmkv_core::{Config, EngineKind, OpenMode, Store, MIN_POOL_SIZE};
use pmkv_pmem::PersistentMemory;
use serde_json::json;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Every registered engine.
pub const ALL_ENGINES: [EngineKind; 3] = [EngineKind::CMap, EngineKind::STree, EngineKind::Radix];

/// Engines with ordered iteration and range queries.
pub const ORDERED_ENGINES: [EngineKind; 2] = [EngineKind::STree, EngineKind::Radix];

/// Bucket count used by fixtures; small so chains get long.
pub const TEST_BUCKETS: u64 = 64;

/// Node degree used by fixtures; small so trees get deep.
pub const TEST_DEGREE: u32 = 4;

/// Configuration for a fixture pool of `size` bytes.
#[must_use]
pub fn test_config(path: impl Into<PathBuf>, size: u64) -> Config {
    Config::new(path)
        .size(size)
        .buckets(TEST_BUCKETS)
        .degree(TEST_DEGREE)
}

/// A test store with automatic cleanup.
pub struct TestStore {
    /// The store instance.
    pub store: Store,
    kind: EngineKind,
    config: Config,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates a store over anonymous memory.
    pub fn volatile(kind: EngineKind) -> Self {
        Self::volatile_sized(kind, MIN_POOL_SIZE)
    }

    /// Creates a store over anonymous memory of `size` bytes.
    pub fn volatile_sized(kind: EngineKind, size: u64) -> Self {
        let config = test_config("volatile", size);
        let store =
            Store::open_volatile_with_config(kind, &config).expect("Failed to open volatile store");
        Self {
            store,
            kind,
            config,
            _temp_dir: None,
        }
    }

    /// Creates a store over a pool file in a temporary directory.
    ///
    /// The store is opened through its JSON configuration.
    pub fn file(kind: EngineKind) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("pool");
        let config_json = json!({
            "path": path,
            "size": MIN_POOL_SIZE,
            "force_create": 1,
            "buckets": TEST_BUCKETS,
            "degree": TEST_DEGREE,
        });
        let store = Store::open(kind.name(), &config_json.to_string())
            .expect("Failed to open file store");
        Self {
            store,
            kind,
            config: Config::new(path),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the engine of the store.
    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    /// Returns the pool file if file-based, None if volatile.
    pub fn path(&self) -> Option<&Path> {
        self._temp_dir.as_ref().map(|_| self.config.path.as_path())
    }

    /// Closes the store cleanly and opens it again.
    ///
    /// A volatile store keeps its memory across the reopen.
    pub fn reopen(self) -> Self {
        if self._temp_dir.is_some() {
            self.store.close().expect("Failed to close store");
        }
        self.crash_and_reopen()
    }

    /// Releases the store without flushing and opens it again, running
    /// recovery.
    pub fn crash_and_reopen(self) -> Self {
        let Self {
            store,
            kind,
            config,
            _temp_dir,
        } = self;
        let region = store.crash();
        let store = match (&_temp_dir, region) {
            (Some(_), region) => {
                // the file lock is released when the mapping is dropped
                drop(region);
                Store::open_with_config(kind, &config).expect("Failed to reopen file store")
            }
            (None, Some(region)) => reopen_region(kind, region),
            (None, None) => panic!("volatile store was already closed"),
        };
        Self {
            store,
            kind,
            config,
            _temp_dir,
        }
    }
}

impl std::ops::Deref for TestStore {
    type Target = Store;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Opens the pool left in `region` after a crash.
pub fn reopen_region(kind: EngineKind, region: Box<dyn PersistentMemory>) -> Store {
    Store::open_region(kind, region, OpenMode::Open, &Config::new("volatile"))
        .expect("Failed to recover store")
}

/// Runs a test with a temporary volatile store.
///
/// # Example
///
/// ```rust,ignore
/// use pmkv_testkit::with_temp_store;
///
/// #[test]
/// fn my_test() {
///     with_temp_store(EngineKind::Radix, |store| {
///         store.put(b"k", b"v").unwrap();
///     });
/// }
/// ```
pub fn with_temp_store<F, R>(kind: EngineKind, f: F) -> R
where
    F: FnOnce(&Store) -> R,
{
    let test_store = TestStore::volatile(kind);
    f(&test_store.store)
}

/// Runs a test with a temporary file-based store.
pub fn with_file_store<F, R>(kind: EngineKind, f: F) -> R
where
    F: FnOnce(&Store, &Path) -> R,
{
    let test_store = TestStore::file(kind);
    let path = test_store
        .path()
        .expect("File store should have a path")
        .to_path_buf();
    f(&test_store.store, &path)
}

/// Key of the `i`-th fixture entry. Zero-padded so numeric and byte order agree.
pub fn key(i: usize) -> Vec<u8> {
    format!("key{i:08}").into_bytes()
}

/// Value of the `i`-th fixture entry.
pub fn value(i: usize) -> Vec<u8> {
    format!("value-{i}").into_bytes()
}

/// Collects every entry of `store` in visiting order.
pub fn collect_entries(store: &Store) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut entries = Vec::new();
    store
        .get_all(|k, v| {
            entries.push((k.to_vec(), v.to_vec()));
            ControlFlow::Continue(())
        })
        .expect("Failed to iterate store");
    entries
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a volatile store holding entries `0..count`.
    pub fn populated_store(kind: EngineKind, count: usize) -> TestStore {
        let test_store = TestStore::volatile(kind);
        for i in 0..count {
            test_store
                .put(&key(i), &value(i))
                .expect("Failed to put entry");
        }
        test_store
    }
}
