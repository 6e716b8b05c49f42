//! Crash recovery testing for pmkv.
//!
//! This module simulates process death at various points inside a
//! mutation and verifies that the reopened store recovers to a state in
//! which the mutation either fully happened or did not happen at all.
//!
//! ## Test Strategy
//!
//! 1. **Crash before commit** - the new value must be absent
//! 2. **Crash during commit** - dirty ranges persisted, lane still active;
//!    the new value must be absent
//! 3. **Crash after commit** - the new value must survive intact
//! 4. **Write sweep** - the region stops accepting writes after the n-th
//!    write, for every n a put can reach; the key must hold the old or the
//!    new value, never anything else
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pmkv_testkit::crash::CrashRecoveryHarness;
//!
//! let mut harness = CrashRecoveryHarness::new(EngineKind::STree);
//! harness.run_all_tests();
//! assert!(harness.all_passed(), "{}", harness.summary());
//! ```

use crate::fixtures::{key, test_config, value};
use pmkv_core::{Config, CoreError, CoreResult, EngineKind, FailPoint, OpenMode, Store, MIN_POOL_SIZE};
use pmkv_pmem::{PersistentMemory, PmemError, PmemResult, VolatileRegion};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Points at which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// All mutations applied, commit not started.
    BeforeCommit,
    /// Dirty ranges persisted, lane still active.
    DuringCommit,
    /// Lane cleared; hooks and frees not yet run.
    AfterCommit,
    /// The region refuses every write after this many more writes.
    AfterWrites(u64),
}

impl CrashPoint {
    /// Returns the core fail point, if this crash is injected by one.
    pub fn fail_point(self) -> Option<FailPoint> {
        match self {
            Self::BeforeCommit => Some(FailPoint::BeforeCommit),
            Self::DuringCommit => Some(FailPoint::DuringCommit),
            Self::AfterCommit => Some(FailPoint::AfterCommit),
            Self::AfterWrites(_) => None,
        }
    }

    /// Returns true if the interrupted mutation must be visible after recovery.
    pub fn commits(self) -> bool {
        matches!(self, Self::AfterCommit)
    }
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Expected entries after recovery.
    pub expected_entries: u64,
    /// Actual entries after recovery.
    pub actual_entries: u64,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str, entries: u64) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            expected_entries: entries,
            actual_entries: entries,
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, expected: u64, actual: u64, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            expected_entries: expected,
            actual_entries: actual,
            error: Some(error.to_string()),
        }
    }
}

/// A region wrapper that stops accepting writes after a budget runs out.
///
/// Writes made before the crash stay in the inner region, as if every
/// cache line reached the media. Reads keep working so the crashed store
/// can be released.
pub struct CrashableRegion {
    inner: Arc<VolatileRegion>,
    writes: AtomicU64,
    crash_at: AtomicU64,
    crashed: AtomicBool,
}

impl CrashableRegion {
    /// Wraps `inner`; no crash is armed.
    pub fn new(inner: Arc<VolatileRegion>) -> Self {
        Self {
            inner,
            writes: AtomicU64::new(0),
            crash_at: AtomicU64::new(u64::MAX),
            crashed: AtomicBool::new(false),
        }
    }

    /// Arms a crash after `writes` more successful writes.
    pub fn crash_after(&self, writes: u64) {
        let now = self.writes.load(Ordering::SeqCst);
        self.crash_at
            .store(now.saturating_add(writes), Ordering::SeqCst);
    }

    /// Disarms the crash and clears the crashed flag.
    pub fn reset(&self) {
        self.crash_at.store(u64::MAX, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
    }

    /// Returns whether a write was refused.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Returns the number of writes accepted so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn crash_error(&self, what: &str) -> PmemError {
        self.crashed.store(true, Ordering::SeqCst);
        PmemError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("simulated crash during {what}"),
        ))
    }
}

impl PersistentMemory for CrashableRegion {
    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> PmemResult<()> {
        self.inner.read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> PmemResult<()> {
        if self.has_crashed() {
            return Err(self.crash_error("write"));
        }
        let done = self.writes.load(Ordering::SeqCst);
        if done >= self.crash_at.load(Ordering::SeqCst) {
            return Err(self.crash_error("write"));
        }
        self.inner.write_at(offset, data)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn persist(&self, offset: u64, len: u64) -> PmemResult<()> {
        if self.has_crashed() {
            return Err(self.crash_error("persist"));
        }
        self.inner.persist(offset, len)
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn path(&self) -> Option<&Path> {
        None
    }
}

/// Test harness for crash recovery scenarios on one engine.
pub struct CrashRecoveryHarness {
    /// Engine under test.
    pub kind: EngineKind,
    /// Entries committed before each crash.
    pub prefill: usize,
    /// Results of crash recovery tests.
    pub results: Vec<CrashRecoveryResult>,
}

impl CrashRecoveryHarness {
    /// Creates a harness that prefills 64 entries before each crash.
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            prefill: 64,
            results: Vec::new(),
        }
    }

    /// Opens a fresh store over a crashable region and prefills it.
    fn open_fresh(&self) -> CoreResult<(Store, Arc<VolatileRegion>, Arc<CrashableRegion>)> {
        let inner = Arc::new(VolatileRegion::new(MIN_POOL_SIZE)?);
        let region = Arc::new(CrashableRegion::new(Arc::clone(&inner)));
        let store = Store::open_region(
            self.kind,
            Box::new(Arc::clone(&region)),
            OpenMode::Create,
            &test_config("volatile", MIN_POOL_SIZE),
        )?;
        for i in 0..self.prefill {
            store.put(&key(i), &value(i))?;
        }
        Ok((store, inner, region))
    }

    /// Interrupts one put at `point` and checks the recovered store.
    ///
    /// With `replace` the put overwrites an existing key, otherwise it
    /// inserts a new one.
    pub fn test_crash(&mut self, point: CrashPoint, replace: bool) -> CrashRecoveryResult {
        self.record(point, replace).0
    }

    fn record(&mut self, point: CrashPoint, replace: bool) -> (CrashRecoveryResult, bool) {
        let description = format!(
            "{} {} interrupted at {point:?}",
            self.kind,
            if replace { "replace" } else { "insert" }
        );
        let prefill = self.prefill as u64;
        let (result, crashed) = self.run_crash(point, replace).unwrap_or_else(|e| {
            let result = CrashRecoveryResult::fail(&description, prefill, 0, &e.to_string());
            (result, true)
        });
        let result = CrashRecoveryResult {
            description,
            ..result
        };
        self.results.push(result.clone());
        (result, crashed)
    }

    fn run_crash(
        &self,
        point: CrashPoint,
        replace: bool,
    ) -> CoreResult<(CrashRecoveryResult, bool)> {
        let (store, inner, region) = self.open_fresh()?;
        let target = if replace { key(0) } else { key(self.prefill) };
        let old = store.get(&target)?;
        let new_value = vec![0xA5u8; 300];

        match (point.fail_point(), point) {
            (Some(fail_point), _) => store.set_fail_point(Some(fail_point))?,
            (None, CrashPoint::AfterWrites(n)) => region.crash_after(n),
            (None, _) => {}
        }

        let outcome = store.put(&target, &new_value);
        let crashed = region.has_crashed() || point.fail_point().is_some();
        if !crashed {
            // the write budget outlasted the put
            outcome?;
        }
        drop(store.crash());
        drop(region);

        let store = Store::open_region(
            self.kind,
            Box::new(inner),
            OpenMode::Open,
            &Config::new("volatile"),
        )?;
        let entries = store.verify()?;
        let found = store.get(&target)?;
        let is_new = found.as_deref() == Some(new_value.as_slice());

        let acceptable = if !crashed || point.commits() {
            is_new
        } else if matches!(point, CrashPoint::AfterWrites(_)) {
            found == old || is_new
        } else {
            found == old
        };

        let expected = self.prefill as u64 + u64::from(!replace && found.is_some());
        for i in 1..self.prefill {
            if store.get(&key(i))?.as_deref() != Some(value(i).as_slice()) {
                let error = format!("untouched key {i} lost its value");
                return Ok((
                    CrashRecoveryResult::fail("", expected, entries, &error),
                    crashed,
                ));
            }
        }

        let result = if acceptable && entries == expected {
            CrashRecoveryResult::pass("", entries)
        } else {
            let error = format!("recovered value {found:?} is neither allowed state");
            CrashRecoveryResult::fail("", expected, entries, &error)
        };
        Ok((result, crashed))
    }

    /// Crashes a put after every possible number of writes, up to `limit`,
    /// until one completes. Returns the number of crash points tried.
    pub fn sweep_writes(&mut self, replace: bool, limit: u64) -> u64 {
        for n in 0..limit {
            let (result, crashed) = self.record(CrashPoint::AfterWrites(n), replace);
            if !result.passed || !crashed {
                return n + 1;
            }
        }
        limit
    }

    /// Runs every scenario for inserts and replacements.
    pub fn run_all_tests(&mut self) -> &[CrashRecoveryResult] {
        for replace in [false, true] {
            for point in [
                CrashPoint::BeforeCommit,
                CrashPoint::DuringCommit,
                CrashPoint::AfterCommit,
            ] {
                self.test_crash(point, replace);
            }
            self.sweep_writes(replace, 512);
        }
        &self.results
    }

    /// Returns whether all tests passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// Returns a one-line-per-test summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for result in &self.results {
            out.push_str(if result.passed { "PASS " } else { "FAIL " });
            out.push_str(&result.description);
            if let Some(error) = &result.error {
                out.push_str(": ");
                out.push_str(error);
            }
            out.push('\n');
        }
        out
    }
}

/// Returns true if `err` is what a crashed store reports.
pub fn is_crash_error(err: &CoreError) -> bool {
    matches!(
        err,
        CoreError::TransactionFailed { .. } | CoreError::Io(_) | CoreError::StoreClosed
    )
}
