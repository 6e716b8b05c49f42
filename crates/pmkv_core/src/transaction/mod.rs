//! Undo-logged transactions.
//!
//! A [`Transaction`] groups heap allocations, frees and writes into the pool
//! so that after a crash either all of them or none of them are visible.
//!
//! # Protocol
//!
//! - Before the first write to a range that existed before the transaction,
//!   the old bytes are appended to the transaction's lane and persisted.
//!   Ranges inside blocks allocated by the same transaction are not logged:
//!   if the transaction rolls back, nothing points at them.
//! - Commit persists every written range, then clears the lane. Clearing the
//!   lane is the commit point.
//! - Abort, drop of an unfinished transaction, and recovery at open all
//!   apply the lane's entries newest first.
//!
//! Volatile state that must only reflect committed data (entry counts,
//! published roots) is updated through [`Transaction::on_commit`] hooks.
//! Hooks run after the commit point and before freed blocks become
//! reusable.

mod lane;
mod manager;
mod state;

pub(crate) use manager::LaneManager;
pub use state::{FailPoint, TransactionState};

use crate::error::{CoreError, CoreResult};
use crate::heap::{Block, BLOCK_FREE, BLOCK_USED};
use crate::pool::Pool;
use crate::types::Handle;
use lane::Lane;
use parking_lot::MutexGuard;
use std::collections::BTreeMap;
use std::fmt;

/// Dirty ranges closer than this are persisted together.
const PERSIST_MERGE_GAP: u64 = 4096;

/// A unit of atomic mutation of the pool.
///
/// Created by [`Pool::begin`]. Dropping a transaction that was neither
/// committed nor aborted aborts it.
pub struct Transaction<'p> {
    pool: &'p Pool,
    lane: MutexGuard<'p, Lane>,
    id: u64,
    state: TransactionState,
    used: u64,
    logged: BTreeMap<u64, u64>,
    fresh: BTreeMap<u64, u64>,
    dirty: Vec<(u64, u64)>,
    allocated: Vec<Block>,
    freed: Vec<Block>,
    hooks: Vec<Box<dyn FnOnce() + 'p>>,
    crashed: bool,
}

impl<'p> Transaction<'p> {
    pub(crate) fn begin(pool: &'p Pool) -> CoreResult<Self> {
        pool.ensure_usable()?;
        let lane = pool.lanes().acquire();
        let id = pool.lanes().next_txid();
        Ok(Self {
            pool,
            lane,
            id,
            state: TransactionState::Started,
            used: 0,
            logged: BTreeMap::new(),
            fresh: BTreeMap::new(),
            dirty: Vec::new(),
            allocated: Vec::new(),
            freed: Vec::new(),
            hooks: Vec::new(),
            crashed: false,
        })
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns the pool this transaction mutates.
    #[must_use]
    pub fn pool(&self) -> &'p Pool {
        self.pool
    }

    /// Allocates a block with room for `size` payload bytes.
    ///
    /// The payload is uninitialized; writes into it are not logged.
    ///
    /// # Errors
    ///
    /// Returns `OutOfSpace` if the heap is exhausted, or `TransactionFailed`
    /// if the lane is full.
    pub fn alloc(&mut self, size: u64) -> CoreResult<Handle> {
        self.state.ensure_started()?;
        let block = self.pool.heap().reserve(self.pool.media(), size)?;
        self.allocated.push(block);
        self.write_u64(block.state_offset(), BLOCK_USED)?;
        self.fresh
            .insert(block.handle().as_u64(), block.offset + block.size);
        Ok(block.handle())
    }

    /// Frees an allocated block. It becomes reusable after commit.
    ///
    /// # Errors
    ///
    /// Returns `CorruptMetadata` if the handle does not name an allocated
    /// block or was already freed here.
    pub fn free(&mut self, handle: Handle) -> CoreResult<()> {
        self.state.ensure_started()?;
        if self.freed.iter().any(|block| block.handle() == handle) {
            return Err(CoreError::corrupt(format!("double free of {handle}")));
        }
        let block = self.pool.heap().block_of(self.pool.media(), handle)?;
        self.write_u64(block.state_offset(), BLOCK_FREE)?;
        self.freed.push(block);
        Ok(())
    }

    /// Writes `data` at region offset `offset`.
    ///
    /// # Errors
    ///
    /// Returns `TransactionFailed` if the lane cannot hold the old bytes,
    /// or a region error.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> CoreResult<()> {
        self.state.ensure_started()?;
        let len = data.len() as u64;
        if len == 0 {
            return Ok(());
        }
        if !covers(&self.fresh, offset, len) {
            self.snapshot(offset, len)?;
        }
        self.pool.media().write(offset, data)?;
        self.dirty.push((offset, len));
        Ok(())
    }

    /// Writes a little-endian `u64` at `offset`.
    ///
    /// # Errors
    ///
    /// See [`Transaction::write`].
    pub fn write_u64(&mut self, offset: u64, value: u64) -> CoreResult<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Registers a hook to run once the transaction is durable.
    pub fn on_commit(&mut self, hook: impl FnOnce() + 'p) {
        self.hooks.push(Box::new(hook));
    }

    fn snapshot(&mut self, offset: u64, len: u64) -> CoreResult<()> {
        if covers(&self.logged, offset, len) {
            return Ok(());
        }
        let media = self.pool.media();
        let old = media.read_vec(offset, len as usize)?;
        self.used = self.lane.append(media, self.used, offset, &old)?;
        self.lane.publish(media, self.used, self.id)?;
        let end = offset + len;
        self.logged
            .entry(offset)
            .and_modify(|logged_end| *logged_end = (*logged_end).max(end))
            .or_insert(end);
        Ok(())
    }

    /// Makes every change durable.
    ///
    /// # Errors
    ///
    /// If persisting fails the transaction is rolled back and the error is
    /// returned. If the rollback fails too, the pool is poisoned.
    pub fn commit(mut self) -> CoreResult<()> {
        self.state.ensure_started()?;
        self.state = TransactionState::Committing;
        self.fail(FailPoint::BeforeCommit)?;

        if let Err(err) = self.persist_dirty() {
            return Err(self.abort_after(err));
        }
        self.fail(FailPoint::DuringCommit)?;

        if self.used > 0 {
            if let Err(err) = self.lane.clear(self.pool.media()) {
                return Err(self.abort_after(err));
            }
        }
        self.state = TransactionState::Committed;
        self.fail(FailPoint::AfterCommit)?;

        for hook in self.hooks.drain(..) {
            hook();
        }
        for block in self.freed.drain(..) {
            self.pool.heap().release(block);
        }
        self.allocated.clear();
        self.pool.record_commit();
        Ok(())
    }

    /// Rolls back every change.
    ///
    /// # Errors
    ///
    /// Returns an error if restoring the logged ranges fails; the pool is
    /// poisoned in that case.
    pub fn abort(mut self) -> CoreResult<()> {
        self.state.ensure_started()?;
        self.rollback()
    }

    fn persist_dirty(&mut self) -> CoreResult<()> {
        self.dirty.sort_unstable();
        let media = self.pool.media();
        let mut pending: Option<(u64, u64)> = None;
        for &(offset, len) in &self.dirty {
            let end = offset + len;
            pending = match pending {
                Some((start, stop)) if offset <= stop + PERSIST_MERGE_GAP => {
                    Some((start, stop.max(end)))
                }
                Some((start, stop)) => {
                    media.persist(start, stop - start)?;
                    Some((offset, end))
                }
                None => Some((offset, end)),
            };
        }
        if let Some((start, stop)) = pending {
            media.persist(start, stop - start)?;
        }
        Ok(())
    }

    fn abort_after(&mut self, err: CoreError) -> CoreError {
        if let Err(rollback_err) = self.rollback() {
            tracing::error!(
                txid = self.id,
                error = %rollback_err,
                "rollback after failed commit failed"
            );
        }
        err
    }

    fn rollback(&mut self) -> CoreResult<()> {
        self.state = TransactionState::Aborting;
        let result = if self.used > 0 {
            self.lane.rollback(self.pool.media(), self.used).map(|_| ())
        } else {
            Ok(())
        };

        match result {
            Ok(()) => {
                for block in self.allocated.drain(..) {
                    self.pool.heap().release(block);
                }
                self.freed.clear();
                self.hooks.clear();
                self.state = TransactionState::Aborted;
                self.pool.record_abort();
                Ok(())
            }
            Err(err) => {
                // the pool now holds a half-restored lane; only recovery may touch it
                self.crashed = true;
                self.pool.poison();
                Err(err)
            }
        }
    }

    fn fail(&mut self, point: FailPoint) -> CoreResult<()> {
        if !self.pool.take_fail_point(point) {
            return Ok(());
        }
        self.crashed = true;
        self.pool.poison();
        tracing::warn!(txid = self.id, ?point, "simulated crash");
        Err(CoreError::transaction_failed(format!(
            "simulated crash at {point:?}"
        )))
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.crashed || self.state.is_terminal() {
            return;
        }
        if let Err(err) = self.rollback() {
            tracing::error!(txid = self.id, error = %err, "abort on drop failed; pool poisoned");
        }
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("lane", &self.lane.index())
            .field("state", &self.state)
            .field("log_bytes", &self.used)
            .field("allocated", &self.allocated.len())
            .field("freed", &self.freed.len())
            .finish()
    }
}

/// Returns true if one range in `ranges` (start -> end) contains `offset..offset + len`.
fn covers(ranges: &BTreeMap<u64, u64>, offset: u64, len: u64) -> bool {
    ranges
        .range(..=offset)
        .next_back()
        .is_some_and(|(_, end)| offset + len <= *end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineTuning;
    use crate::heap::BLOCK_HEADER;
    use crate::types::EngineKind;
    use pmkv_pmem::{PersistentMemory, VolatileRegion};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    const POOL_SIZE: u64 = 8 << 20;

    fn tuning() -> EngineTuning {
        EngineTuning {
            lanes: 4,
            lane_size: 8192,
            ..EngineTuning::default()
        }
    }

    /// A pool whose root is one 64 byte block.
    fn pool_over(region: Arc<VolatileRegion>) -> Pool {
        Pool::create(
            Box::new(region),
            EngineKind::CMap,
            &tuning(),
            true,
            |tx| tx.alloc(48),
        )
        .unwrap()
    }

    fn reopen(region: &VolatileRegion) -> Pool {
        let image = VolatileRegion::from_image(&region.image()).unwrap();
        Pool::open(Box::new(image), Some(EngineKind::CMap), true).unwrap()
    }

    #[test]
    fn covers_checks_containment() {
        let mut ranges = BTreeMap::new();
        ranges.insert(100, 200);
        assert!(covers(&ranges, 100, 100));
        assert!(covers(&ranges, 150, 10));
        assert!(!covers(&ranges, 150, 51));
        assert!(!covers(&ranges, 99, 2));
        assert!(!covers(&ranges, 300, 1));
    }

    #[test]
    fn commit_makes_writes_visible() {
        let region = Arc::new(VolatileRegion::new(POOL_SIZE).unwrap());
        let pool = pool_over(Arc::clone(&region));
        let root = pool.root().unwrap();

        let mut tx = pool.begin().unwrap();
        tx.write(root.as_u64(), b"committed").unwrap();
        tx.commit().unwrap();

        let reopened = reopen(&region);
        assert_eq!(
            reopened.media().read_vec(root.as_u64(), 9).unwrap(),
            b"committed"
        );
        assert_eq!(pool.commits(), 2);
    }

    #[test]
    fn abort_restores_logged_ranges() {
        let region = Arc::new(VolatileRegion::new(POOL_SIZE).unwrap());
        let pool = pool_over(Arc::clone(&region));
        let root = pool.root().unwrap();

        let mut tx = pool.begin().unwrap();
        tx.write(root.as_u64(), b"before").unwrap();
        tx.commit().unwrap();

        let mut tx = pool.begin().unwrap();
        tx.write(root.as_u64(), b"after!").unwrap();
        assert_eq!(pool.media().read_vec(root.as_u64(), 6).unwrap(), b"after!");
        tx.abort().unwrap();

        assert_eq!(pool.media().read_vec(root.as_u64(), 6).unwrap(), b"before");
        assert_eq!(pool.aborts(), 1);
    }

    #[test]
    fn drop_aborts() {
        let region = Arc::new(VolatileRegion::new(POOL_SIZE).unwrap());
        let pool = pool_over(Arc::clone(&region));
        let root = pool.root().unwrap();
        let before = pool.heap_stats();

        {
            let mut tx = pool.begin().unwrap();
            let block = tx.alloc(1000).unwrap();
            tx.write(block.as_u64(), b"scratch").unwrap();
            tx.write_u64(root.as_u64(), block.as_u64()).unwrap();
        }

        assert_eq!(pool.media().read_u64(root.as_u64()).unwrap(), 0);
        let after = pool.heap_stats();
        assert_eq!(after.used_blocks, before.used_blocks);
        assert_eq!(after.free_blocks, before.free_blocks + 1);
        // the aborted block is FREE on media as well
        assert!(Pool::open(
            Box::new(VolatileRegion::from_image(&region.image()).unwrap()),
            None,
            true
        )
        .is_ok());
    }

    #[test]
    fn fresh_blocks_are_not_logged() {
        let region = Arc::new(VolatileRegion::new(POOL_SIZE).unwrap());
        let pool = pool_over(region);

        let mut tx = pool.begin().unwrap();
        let block = tx.alloc(4000).unwrap();
        let after_alloc = tx.used;
        tx.write(block.as_u64(), &[7u8; 4000]).unwrap();
        assert_eq!(tx.used, after_alloc);
        tx.commit().unwrap();
    }

    #[test]
    fn freed_block_reusable_only_after_commit() {
        let region = Arc::new(VolatileRegion::new(POOL_SIZE).unwrap());
        let pool = pool_over(region);

        let mut tx = pool.begin().unwrap();
        let block = tx.alloc(100).unwrap();
        tx.commit().unwrap();

        let mut tx = pool.begin().unwrap();
        tx.free(block).unwrap();
        assert!(matches!(
            tx.free(block),
            Err(CoreError::CorruptMetadata { .. })
        ));
        let other = tx.alloc(100).unwrap();
        assert_ne!(other, block);
        tx.commit().unwrap();

        let mut tx = pool.begin().unwrap();
        assert_eq!(tx.alloc(100).unwrap(), block);
        tx.commit().unwrap();
    }

    #[test]
    fn aborted_free_keeps_block_allocated() {
        let region = Arc::new(VolatileRegion::new(POOL_SIZE).unwrap());
        let pool = pool_over(region);

        let mut tx = pool.begin().unwrap();
        let block = tx.alloc(100).unwrap();
        tx.commit().unwrap();

        let mut tx = pool.begin().unwrap();
        tx.free(block).unwrap();
        tx.abort().unwrap();

        assert!(pool.heap().block_of(pool.media(), block).is_ok());
    }

    #[test]
    fn hooks_run_only_on_commit() {
        let region = Arc::new(VolatileRegion::new(POOL_SIZE).unwrap());
        let pool = pool_over(region);
        let counter = AtomicU64::new(0);

        let mut tx = pool.begin().unwrap();
        tx.on_commit(|| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tx.abort().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let mut tx = pool.begin().unwrap();
        tx.on_commit(|| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tx.commit().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn full_lane_fails_and_rolls_back() {
        let region = Arc::new(VolatileRegion::new(POOL_SIZE).unwrap());
        let pool = pool_over(region);

        let mut tx = pool.begin().unwrap();
        let big = tx.alloc(16 * 1024).unwrap();
        tx.commit().unwrap();

        let mut tx = pool.begin().unwrap();
        let err = tx.write(big.as_u64(), &[1u8; 16 * 1024]).unwrap_err();
        assert!(matches!(err, CoreError::TransactionFailed { .. }));
        drop(tx);

        assert!(pool.media().read_vec(big.as_u64(), 16).unwrap() != vec![1u8; 16]);
        assert!(!pool.is_poisoned());
    }

    #[test]
    fn crash_before_commit_rolls_back_on_open() {
        for point in [FailPoint::BeforeCommit, FailPoint::DuringCommit] {
            let region = Arc::new(VolatileRegion::new(POOL_SIZE).unwrap());
            let pool = pool_over(Arc::clone(&region));
            let root = pool.root().unwrap();

            pool.arm_fail_point(Some(point));
            let mut tx = pool.begin().unwrap();
            tx.write(root.as_u64(), b"torn?").unwrap();
            assert!(matches!(
                tx.commit(),
                Err(CoreError::TransactionFailed { .. })
            ));
            assert!(pool.is_poisoned());
            assert!(matches!(pool.begin(), Err(CoreError::StoreClosed)));
            // the crash left the lane active and the bytes modified
            assert_eq!(region.read_vec(root.as_u64(), 5).unwrap(), b"torn?");

            let reopened = reopen(&region);
            assert_eq!(
                reopened.media().read_vec(root.as_u64(), 5).unwrap(),
                vec![0u8; 5]
            );
        }
    }

    #[test]
    fn crash_after_commit_keeps_data() {
        let region = Arc::new(VolatileRegion::new(POOL_SIZE).unwrap());
        let pool = pool_over(Arc::clone(&region));
        let root = pool.root().unwrap();

        pool.arm_fail_point(Some(FailPoint::AfterCommit));
        let mut tx = pool.begin().unwrap();
        tx.write(root.as_u64(), b"durable").unwrap();
        assert!(tx.commit().is_err());

        let reopened = reopen(&region);
        assert_eq!(
            reopened.media().read_vec(root.as_u64(), 7).unwrap(),
            b"durable"
        );
    }

    #[test]
    fn crash_mid_alloc_leaves_block_free() {
        let region = Arc::new(VolatileRegion::new(POOL_SIZE).unwrap());
        let pool = pool_over(Arc::clone(&region));

        pool.arm_fail_point(Some(FailPoint::DuringCommit));
        let mut tx = pool.begin().unwrap();
        let block = tx.alloc(500).unwrap();
        assert!(tx.commit().is_err());

        let reopened = reopen(&region);
        let state = reopened
            .media()
            .read_u64(block.as_u64() - BLOCK_HEADER + 8)
            .unwrap();
        assert_eq!(state, BLOCK_FREE);
        assert_eq!(reopened.heap_stats().free_blocks, 1);
    }
}
