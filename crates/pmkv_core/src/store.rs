//! Store facade.
//!
//! A [`Store`] binds one engine to one pool and exposes the key-value
//! operations. Every operation is safe to call from many threads through a
//! shared reference.
//!
//! ```rust,ignore
//! use pmkv_core::Store;
//!
//! let store = Store::open(
//!     "cmap",
//!     r#"{"path": "/dev/shm/phonebook", "size": 1073741824, "force_create": 1}"#,
//! )?;
//! store.put(b"John", b"123-456-789")?;
//! assert_eq!(store.get(b"John")?, Some(b"123-456-789".to_vec()));
//! store.close()?;
//! ```
//!
//! Mutations run in one pool transaction each: a put or remove is either
//! fully visible after a crash or not at all.

use crate::config::Config;
use crate::engine;
use crate::error::{CoreError, CoreResult};
use crate::index::Index;
use crate::iter::{KeyRange, ScanMode};
use crate::pool::header::PoolHeader;
use crate::pool::{read_header, Pool};
use crate::record;
use crate::stats::{StoreCounters, StoreStats};
use crate::transaction::FailPoint;
use crate::types::EngineKind;
use parking_lot::{Mutex, RwLock};
use pmkv_pmem::{MappedRegion, PersistentMemory, VolatileRegion};
use std::ops::{Bound, ControlFlow};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// How [`Store::open_region`] treats the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Format the region as a new, empty pool.
    Create,
    /// Open and recover the pool already in the region.
    Open,
}

struct OpenStore {
    index: Box<dyn Index>,
    pool: Arc<Pool>,
}

/// An open key-value store.
pub struct Store {
    kind: EngineKind,
    path: Option<PathBuf>,
    state: RwLock<Option<OpenStore>>,
    counters: StoreCounters,
    /// Threads currently running a visitor, once per nested iteration.
    visiting: Mutex<Vec<ThreadId>>,
}

/// Marks the calling thread as inside an iteration of `store`.
struct VisitMark<'a> {
    visiting: &'a Mutex<Vec<ThreadId>>,
}

impl<'a> VisitMark<'a> {
    fn enter(visiting: &'a Mutex<Vec<ThreadId>>) -> Self {
        visiting.lock().push(thread::current().id());
        Self { visiting }
    }
}

impl Drop for VisitMark<'_> {
    fn drop(&mut self) {
        let me = thread::current().id();
        let mut visiting = self.visiting.lock();
        if let Some(at) = visiting.iter().rposition(|id| *id == me) {
            visiting.swap_remove(at);
        }
    }
}

impl Store {
    /// Opens a store by engine name and JSON configuration.
    ///
    /// The engine name is resolved before the configuration is parsed.
    ///
    /// # Errors
    ///
    /// - `EngineUnknown` for an unregistered engine name
    /// - `InvalidConfig` for a malformed configuration, or a pool created
    ///   for another engine
    /// - anything [`Store::open_with_config`] returns
    pub fn open(engine: &str, json: &str) -> CoreResult<Self> {
        let kind = engine::lookup(engine)?.kind;
        let config = Config::from_json(json)?;
        Self::open_with_config(kind, &config)
    }

    /// Opens or creates the pool file described by `config`.
    ///
    /// - `force_create` creates a new pool, replacing any existing file
    /// - otherwise an existing file is opened and recovered
    /// - a missing file is created only with `create_if_missing`
    ///
    /// # Errors
    ///
    /// - `InvalidConfig` if the configuration fails validation, a create
    ///   has no size, or a create sets a tuning key of `kind` out of range
    /// - `PathUnavailable` if the file is missing and may not be created, or
    ///   cannot be created or mapped
    /// - `AlreadyOpen` if another store holds the file
    /// - `CorruptMetadata` or `VersionMismatch` if the pool is unreadable
    pub fn open_with_config(kind: EngineKind, config: &Config) -> CoreResult<Self> {
        config.validate()?;
        let path = config.path.as_path();

        let (region, mode) = if config.force_create {
            config.tuning.validate_for(kind)?;
            (create_file(path, config, true)?, OpenMode::Create)
        } else if path.exists() {
            let region = MappedRegion::open(path).map_err(|err| CoreError::from_open(err, path))?;
            (region, OpenMode::Open)
        } else if config.create_if_missing {
            config.tuning.validate_for(kind)?;
            (create_file(path, config, false)?, OpenMode::Create)
        } else {
            return Err(CoreError::PathUnavailable {
                path: path.to_path_buf(),
                reason: "file does not exist; set create_if_missing or force_create".into(),
            });
        };

        Self::open_region(kind, Box::new(region), mode, config)
    }

    /// Opens a store over any region.
    ///
    /// Only the tuning and `sync_on_commit` of `config` are used; the path
    /// and creation flags are ignored.
    ///
    /// # Errors
    ///
    /// Returns the pool creation or recovery error, or `InvalidConfig` if
    /// the region holds a pool of another engine.
    pub fn open_region(
        kind: EngineKind,
        region: Box<dyn PersistentMemory>,
        mode: OpenMode,
        config: &Config,
    ) -> CoreResult<Self> {
        let entry = engine::entry(kind);
        let pool = match mode {
            OpenMode::Create => Pool::create(
                region,
                kind,
                &config.tuning,
                config.sync_on_commit,
                |tx| (entry.create)(tx, &config.tuning),
            )?,
            OpenMode::Open => Pool::open(region, Some(kind), config.sync_on_commit)?,
        };

        let pool = Arc::new(pool);
        let root = pool.root()?;
        let index = (entry.open)(Arc::clone(&pool), root)?;
        let path = pool.path().map(Path::to_path_buf);

        tracing::info!(
            engine = %kind,
            path = ?path,
            entries = index.count(),
            "store opened"
        );

        Ok(Self {
            kind,
            path,
            state: RwLock::new(Some(OpenStore { index, pool })),
            counters: StoreCounters::default(),
            visiting: Mutex::new(Vec::new()),
        })
    }

    /// Creates an empty store in anonymous memory.
    ///
    /// Its contents are lost when the store is dropped.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `size` cannot hold a pool.
    pub fn open_volatile(kind: EngineKind, size: u64) -> CoreResult<Self> {
        Self::open_volatile_with_config(kind, &Config::new("volatile").size(size))
    }

    /// Creates an empty store in anonymous memory with the tuning of `config`.
    ///
    /// The size is taken from `config` and is required.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the size is missing or too small.
    pub fn open_volatile_with_config(kind: EngineKind, config: &Config) -> CoreResult<Self> {
        let size = config
            .size
            .ok_or_else(|| CoreError::invalid_config("size is required for a volatile store"))?;
        let region = VolatileRegion::new(size)?;
        Self::open_region(kind, Box::new(region), OpenMode::Create, config)
    }

    /// Opens an existing pool file with whatever engine created it.
    ///
    /// # Errors
    ///
    /// Returns `PathUnavailable` or `AlreadyOpen` if the file cannot be
    /// opened, and the header or recovery error for an unreadable pool.
    pub fn open_path(path: &Path) -> CoreResult<Self> {
        let region = MappedRegion::open(path).map_err(|err| CoreError::from_open(err, path))?;
        let kind = read_header(&region)?.engine;
        Self::open_region(kind, Box::new(region), OpenMode::Open, &Config::new(path))
    }

    // ========================================================================
    // Point operations
    // ========================================================================

    /// Inserts `key` or replaces its value.
    ///
    /// # Errors
    ///
    /// - `InvalidKey` for an empty key
    /// - `OutOfSpace` if the pool is full; the store is unchanged
    /// - `TransactionFailed` if the undo lane overflowed; the store is
    ///   unchanged
    /// - `StoreClosed` after close or a simulated crash
    pub fn put(&self, key: &[u8], value: &[u8]) -> CoreResult<()> {
        check_key(key)?;
        self.with_open(|open| {
            let guard = open.index.write_guard(key);
            let mut tx = open.pool.begin()?;
            let record = record::create(&mut tx, key, value)?;
            if let Some(old) = open.index.insert(&guard, &mut tx, key, record)? {
                tx.free(old)?;
            }
            tx.commit()
        })?;
        self.counters
            .record_write((key.len() + value.len()) as u64);
        Ok(())
    }

    /// Returns a copy of the value of `key`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` for an empty key and `StoreClosed` after close.
    pub fn get(&self, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        check_key(key)?;
        let value = self.with_open(|open| {
            let guard = open.index.read_guard(key);
            match open.index.find(&guard, key)? {
                Some(handle) => record::read_value(&open.pool, handle).map(Some),
                None => Ok(None),
            }
        })?;
        self.counters
            .record_read(value.as_ref().map_or(0, |v| v.len() as u64));
        Ok(value)
    }

    /// Calls `f` with the value of `key`, if present.
    ///
    /// The value is copied out first; no lock is held while `f` runs, so it
    /// may call back into the store. Returns whether the key was found.
    ///
    /// # Errors
    ///
    /// Same as [`Store::get`].
    pub fn get_with(&self, key: &[u8], f: impl FnOnce(&[u8])) -> CoreResult<bool> {
        match self.get(key)? {
            Some(value) => {
                f(&value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Returns the value of `key`, failing if it is absent.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key has no value, otherwise as [`Store::get`].
    pub fn fetch(&self, key: &[u8]) -> CoreResult<Vec<u8>> {
        self.get(key)?.ok_or(CoreError::NotFound)
    }

    /// Returns true if `key` has a value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` for an empty key and `StoreClosed` after close.
    pub fn exists(&self, key: &[u8]) -> CoreResult<bool> {
        check_key(key)?;
        self.with_open(|open| {
            let guard = open.index.read_guard(key);
            Ok(open.index.find(&guard, key)?.is_some())
        })
    }

    /// Removes `key`. Returns false if it was absent.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` for an empty key, `StoreClosed` after close, and
    /// `TransactionFailed` if the removal was rolled back.
    pub fn remove(&self, key: &[u8]) -> CoreResult<bool> {
        check_key(key)?;
        let removed = self.with_open(|open| {
            let guard = open.index.write_guard(key);
            let mut tx = open.pool.begin()?;
            let removed = match open.index.erase(&guard, &mut tx, key)? {
                Some(record) => {
                    tx.free(record)?;
                    true
                }
                None => false,
            };
            tx.commit()?;
            Ok(removed)
        })?;
        if removed {
            self.counters.record_remove();
        }
        Ok(removed)
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    /// Returns the number of entries.
    ///
    /// # Errors
    ///
    /// Returns `StoreClosed` after close.
    pub fn count_all(&self) -> CoreResult<u64> {
        self.with_open(|open| Ok(open.index.count()))
    }

    /// Visits every entry until the visitor breaks.
    ///
    /// Ordered engines visit in ascending key order. `cmap` visits bucket by
    /// bucket in no particular key order. Entries inserted or removed during
    /// the call may or may not be visited.
    ///
    /// The visitor may read and write the store. Calling [`Store::close`]
    /// or [`Store::verify`] from the visitor fails with `Busy`.
    ///
    /// # Errors
    ///
    /// Returns `StoreClosed` after close, or `CorruptMetadata` if a record
    /// cannot be read.
    pub fn get_all(
        &self,
        mut visitor: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> CoreResult<()> {
        self.visit("get_all", KeyRange::all(), ScanMode::Pairs, &mut visitor)
    }

    /// Visits the entries between two bounds in key order.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` on an unordered engine unless both bounds are
    /// unbounded, and `StoreClosed` after close.
    pub fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        mut visitor: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> CoreResult<()> {
        self.visit("scan", KeyRange { lower, upper }, ScanMode::Pairs, &mut visitor)
    }

    /// Visits the entries with keys strictly greater than `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` on `cmap` and `StoreClosed` after close.
    pub fn get_above(
        &self,
        key: &[u8],
        mut visitor: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> CoreResult<()> {
        self.visit("get_above", KeyRange::above(key), ScanMode::Pairs, &mut visitor)
    }

    /// Visits the entries with keys greater than or equal to `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` on `cmap` and `StoreClosed` after close.
    pub fn get_equal_above(
        &self,
        key: &[u8],
        mut visitor: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> CoreResult<()> {
        self.visit(
            "get_equal_above",
            KeyRange::equal_above(key),
            ScanMode::Pairs,
            &mut visitor,
        )
    }

    /// Visits the entries with keys strictly less than `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` on `cmap` and `StoreClosed` after close.
    pub fn get_below(
        &self,
        key: &[u8],
        mut visitor: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> CoreResult<()> {
        self.visit("get_below", KeyRange::below(key), ScanMode::Pairs, &mut visitor)
    }

    /// Visits the entries with keys less than or equal to `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` on `cmap` and `StoreClosed` after close.
    pub fn get_equal_below(
        &self,
        key: &[u8],
        mut visitor: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> CoreResult<()> {
        self.visit(
            "get_equal_below",
            KeyRange::equal_below(key),
            ScanMode::Pairs,
            &mut visitor,
        )
    }

    /// Visits the entries with keys strictly between `low` and `high`.
    ///
    /// Nothing is visited when `low >= high`.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` on `cmap` and `StoreClosed` after close.
    pub fn get_between(
        &self,
        low: &[u8],
        high: &[u8],
        mut visitor: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> CoreResult<()> {
        self.visit(
            "get_between",
            KeyRange::between(low, high),
            ScanMode::Pairs,
            &mut visitor,
        )
    }

    /// Counts the keys strictly greater than `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` on `cmap` and `StoreClosed` after close.
    pub fn count_above(&self, key: &[u8]) -> CoreResult<u64> {
        self.count_range("count_above", KeyRange::above(key))
    }

    /// Counts the keys greater than or equal to `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` on `cmap` and `StoreClosed` after close.
    pub fn count_equal_above(&self, key: &[u8]) -> CoreResult<u64> {
        self.count_range("count_equal_above", KeyRange::equal_above(key))
    }

    /// Counts the keys strictly less than `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` on `cmap` and `StoreClosed` after close.
    pub fn count_below(&self, key: &[u8]) -> CoreResult<u64> {
        self.count_range("count_below", KeyRange::below(key))
    }

    /// Counts the keys less than or equal to `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` on `cmap` and `StoreClosed` after close.
    pub fn count_equal_below(&self, key: &[u8]) -> CoreResult<u64> {
        self.count_range("count_equal_below", KeyRange::equal_below(key))
    }

    /// Counts the keys strictly between `low` and `high`.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` on `cmap` and `StoreClosed` after close.
    pub fn count_between(&self, low: &[u8], high: &[u8]) -> CoreResult<u64> {
        self.count_range("count_between", KeyRange::between(low, high))
    }

    fn count_range(&self, operation: &'static str, range: KeyRange<'_>) -> CoreResult<u64> {
        let mut count = 0u64;
        self.visit(operation, range, ScanMode::KeysOnly, &mut |_, _| {
            count += 1;
            ControlFlow::Continue(())
        })?;
        Ok(count)
    }

    fn visit(
        &self,
        operation: &'static str,
        range: KeyRange<'_>,
        mode: ScanMode,
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> CoreResult<()> {
        self.with_open(|open| {
            if !range.is_full() && !open.index.is_ordered() {
                return Err(CoreError::not_supported(operation, self.kind.name()));
            }
            let _mark = VisitMark::enter(&self.visiting);
            open.index.scan(&range, mode, visitor)
        })?;
        self.counters.record_scan();
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Flushes the pool and closes the store.
    ///
    /// Every later operation fails with `StoreClosed`.
    ///
    /// # Errors
    ///
    /// Returns `StoreClosed` if the store is already closed, `Busy` when
    /// called from a visitor of this store, or the flush error.
    pub fn close(&self) -> CoreResult<()> {
        self.ensure_not_visiting("close")?;
        let open = self.state.write().take().ok_or(CoreError::StoreClosed)?;
        let OpenStore { index, pool } = open;
        drop(index);
        pool.persist_all()?;
        tracing::info!(engine = %self.kind, path = ?self.path, "store closed");
        Ok(())
    }

    /// Same as [`Store::close`].
    ///
    /// # Errors
    ///
    /// Same as [`Store::close`].
    pub fn stop(&self) -> CoreResult<()> {
        self.close()
    }

    /// Releases the store without flushing, as a process death would.
    ///
    /// Returns the region so a test can open it again and observe
    /// recovery. `None` if the store was already closed.
    #[must_use]
    pub fn crash(self) -> Option<Box<dyn PersistentMemory>> {
        let OpenStore { index, pool } = self.state.write().take()?;
        drop(index);
        tracing::warn!(engine = %self.kind, "store released without flush");
        Arc::try_unwrap(pool).ok().map(Pool::into_region)
    }

    /// Returns true until the store is closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.read().is_some()
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Returns the engine of this store.
    #[must_use]
    pub fn engine(&self) -> EngineKind {
        self.kind
    }

    /// Returns the pool file, if the store is file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the pool header.
    ///
    /// # Errors
    ///
    /// Returns `StoreClosed` after close.
    pub fn header(&self) -> CoreResult<PoolHeader> {
        self.with_open(|open| Ok(*open.pool.header()))
    }

    /// Returns a statistics snapshot.
    ///
    /// # Errors
    ///
    /// Returns `StoreClosed` after close.
    pub fn stats(&self) -> CoreResult<StoreStats> {
        self.with_open(|open| {
            Ok(StoreStats::collect(
                self.kind,
                open.index.count(),
                &self.counters,
                open.pool.commits(),
                open.pool.aborts(),
                open.pool.heap_stats(),
            ))
        })
    }

    /// Checks the heap chain and the engine structure.
    ///
    /// Blocks every other operation while it runs. Returns the number of
    /// entries found.
    ///
    /// # Errors
    ///
    /// Returns `CorruptMetadata` describing the first inconsistency, or
    /// `Busy` when called from a visitor of this store.
    pub fn verify(&self) -> CoreResult<u64> {
        self.ensure_not_visiting("verify")?;
        let state = self.state.write();
        let open = state.as_ref().ok_or(CoreError::StoreClosed)?;
        open.pool.ensure_usable()?;
        open.pool.verify_heap()?;
        let entries = open.index.verify()?;
        tracing::debug!(engine = %self.kind, entries, "store verified");
        Ok(entries)
    }

    /// Arms a simulated crash for the next transaction that reaches `point`.
    ///
    /// The store is unusable after the crash fires; reopen its region to
    /// observe recovery. `None` disarms.
    ///
    /// # Errors
    ///
    /// Returns `StoreClosed` after close.
    pub fn set_fail_point(&self, point: Option<FailPoint>) -> CoreResult<()> {
        self.with_open(|open| {
            open.pool.arm_fail_point(point);
            Ok(())
        })
    }

    /// Exclusive state access from inside a visitor of this store deadlocks.
    fn ensure_not_visiting(&self, operation: &'static str) -> CoreResult<()> {
        let me = thread::current().id();
        if self.visiting.lock().contains(&me) {
            return Err(CoreError::Busy { operation });
        }
        Ok(())
    }

    fn with_open<T>(&self, f: impl FnOnce(&OpenStore) -> CoreResult<T>) -> CoreResult<T> {
        let state = self.state.read_recursive();
        let open = state.as_ref().ok_or(CoreError::StoreClosed)?;
        open.pool.ensure_usable()?;
        f(open)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("engine", &self.kind)
            .field("path", &self.path)
            .field("is_open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if self.state.get_mut().is_some() {
            if let Err(err) = self.close() {
                tracing::warn!(engine = %self.kind, error = %err, "close on drop failed");
            }
        }
    }
}

fn check_key(key: &[u8]) -> CoreResult<()> {
    if key.is_empty() {
        return Err(CoreError::InvalidKey);
    }
    Ok(())
}

fn create_file(path: &Path, config: &Config, overwrite: bool) -> CoreResult<MappedRegion> {
    let size = config
        .size
        .ok_or_else(|| CoreError::invalid_config("size is required to create a pool"))?;
    MappedRegion::create(path, size, overwrite).map_err(|err| CoreError::from_open(err, path))
}
