//! Pool lifecycle.
//!
//! A pool is one region laid out as:
//!
//! ```text
//! [header page][lane 0][lane 1]...[lane n-1][pad to 4 KiB][heap ...]
//! ```
//!
//! Creation formats every part, lets the engine build its root block in a
//! first transaction, and writes the magic last. A region without the magic
//! is never mistaken for a pool, so an interrupted creation is simply
//! created again.
//!
//! Opening validates the header, rolls back interrupted transactions, and
//! rebuilds the heap's free index, in that order.

pub mod header;
pub(crate) mod media;

use crate::config::EngineTuning;
use crate::error::{CoreError, CoreResult};
use crate::heap::{Heap, HeapStats};
use crate::transaction::{FailPoint, LaneManager, Transaction};
use crate::types::{EngineKind, Handle};
use header::{
    PoolHeader, ENCODED_LEN, FORMAT_MAJOR, FORMAT_MINOR, HEADER_SIZE, POOL_MAGIC, ROOT_OFFSET,
};
use media::Media;
use parking_lot::Mutex;
use pmkv_pmem::PersistentMemory;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use uuid::Uuid;

/// Alignment of the heap start.
const HEAP_ALIGN: u64 = 4096;

/// Smallest heap a pool may be created with.
const MIN_HEAP: u64 = 64 * 1024;

/// An open pool: header, lanes and heap over one region.
pub struct Pool {
    media: Media,
    header: PoolHeader,
    root: Handle,
    heap: Heap,
    lanes: LaneManager,
    fail_point: Mutex<Option<FailPoint>>,
    poisoned: AtomicBool,
    commits: AtomicU64,
    aborts: AtomicU64,
}

impl Pool {
    /// Formats `region` as a new pool.
    ///
    /// `init` runs inside the first transaction and returns the engine's
    /// root block, which is recorded in the header.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if a tuning value `engine` reads is out of
    /// range or the region cannot hold the lanes and a minimal heap, or any
    /// error from `init`.
    pub fn create(
        region: Box<dyn PersistentMemory>,
        engine: EngineKind,
        tuning: &EngineTuning,
        sync: bool,
        init: impl FnOnce(&mut Transaction<'_>) -> CoreResult<Handle>,
    ) -> CoreResult<Self> {
        tuning.validate_for(engine)?;
        let header = layout(region.len(), engine, tuning)?;
        let media = Media::new(region, sync);

        media.fill(0, HEADER_SIZE, 0)?;
        let (body, crc) = header.encode_without_magic();
        media.write(8, &body)?;
        media.write(header::crc_offset(), &crc.to_le_bytes())?;
        media.persist(0, HEADER_SIZE)?;

        let lanes = LaneManager::new(&header);
        lanes.format(&media)?;
        let heap = Heap::format(&media, header.heap_offset, header.heap_end())?;

        let mut pool = Self::assemble(media, header, Handle::NULL, heap, lanes);
        let root = {
            let mut tx = pool.begin()?;
            let root = init(&mut tx)?;
            tx.write_u64(ROOT_OFFSET, root.as_u64())?;
            tx.commit()?;
            root
        };
        pool.root = root;

        pool.media.write(0, &POOL_MAGIC)?;
        pool.media.persist(0, HEADER_SIZE)?;

        tracing::info!(
            engine = %engine,
            uuid = %header.uuid,
            size = header.pool_size,
            lanes = header.lane_count,
            heap = header.heap_size,
            "pool created"
        );
        Ok(pool)
    }

    /// Opens an existing pool and recovers it.
    ///
    /// With `expected` set, a pool created for another engine is refused.
    ///
    /// # Errors
    ///
    /// - `CorruptMetadata` if the header, a lane or the heap chain fails
    ///   validation
    /// - `VersionMismatch` for an unsupported format
    /// - `InvalidConfig` if the pool belongs to another engine
    pub fn open(
        region: Box<dyn PersistentMemory>,
        expected: Option<EngineKind>,
        sync: bool,
    ) -> CoreResult<Self> {
        let header = read_header(region.as_ref())?;
        if let Some(expected) = expected {
            if expected != header.engine {
                return Err(CoreError::invalid_config(format!(
                    "pool was created for engine {}, not {expected}",
                    header.engine
                )));
            }
        }
        header.check_layout(region.len())?;

        let media = Media::new(region, sync);
        let lanes = LaneManager::new(&header);
        let rolled_back = lanes.recover(&media)?;
        let heap = Heap::recover(&media, header.heap_offset, header.heap_end())?;

        let root = Handle::new(media.read_u64(ROOT_OFFSET)?);
        heap.block_of(&media, root)?;

        let pool = Self::assemble(media, header, root, heap, lanes);
        tracing::info!(
            engine = %header.engine,
            uuid = %header.uuid,
            size = header.pool_size,
            recovered_lanes = rolled_back,
            "pool opened"
        );
        Ok(pool)
    }

    fn assemble(
        media: Media,
        header: PoolHeader,
        root: Handle,
        heap: Heap,
        lanes: LaneManager,
    ) -> Self {
        Self {
            media,
            header,
            root,
            heap,
            lanes,
            fail_point: Mutex::new(None),
            poisoned: AtomicBool::new(false),
            commits: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
        }
    }

    /// Returns the decoded header.
    #[must_use]
    pub fn header(&self) -> &PoolHeader {
        &self.header
    }

    /// Returns the engine's root block.
    ///
    /// # Errors
    ///
    /// Returns `StoreClosed` if the pool is poisoned.
    pub fn root(&self) -> CoreResult<Handle> {
        self.ensure_usable()?;
        Ok(self.root)
    }

    /// Returns the backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.media.region().path()
    }

    /// Begins a transaction, blocking while every lane is busy.
    ///
    /// # Errors
    ///
    /// Returns `StoreClosed` if the pool is poisoned.
    pub fn begin(&self) -> CoreResult<Transaction<'_>> {
        Transaction::begin(self)
    }

    pub(crate) fn media(&self) -> &Media {
        &self.media
    }

    pub(crate) fn heap(&self) -> &Heap {
        &self.heap
    }

    pub(crate) fn lanes(&self) -> &LaneManager {
        &self.lanes
    }

    /// Refuses further transactions until the pool is reopened.
    pub(crate) fn poison(&self) {
        if !self.poisoned.swap(true, Ordering::SeqCst) {
            tracing::error!(uuid = %self.header.uuid, "pool poisoned; reopen to recover");
        }
    }

    /// Returns true after a simulated crash or a failed rollback.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_usable(&self) -> CoreResult<()> {
        if self.is_poisoned() {
            return Err(CoreError::StoreClosed);
        }
        Ok(())
    }

    /// Arms a simulated crash for the next transaction that reaches `point`.
    pub fn arm_fail_point(&self, point: Option<FailPoint>) {
        *self.fail_point.lock() = point;
    }

    /// Disarms and returns true if `point` is armed.
    pub(crate) fn take_fail_point(&self, point: FailPoint) -> bool {
        let mut armed = self.fail_point.lock();
        if *armed == Some(point) {
            *armed = None;
            return true;
        }
        false
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of committed transactions since open.
    #[must_use]
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Returns the number of aborted transactions since open.
    #[must_use]
    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }

    /// Returns allocator statistics.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Checks that a handle read from the pool can name a heap block.
    pub(crate) fn check_handle(&self, handle: Handle) -> CoreResult<()> {
        self.heap.check_handle(handle)
    }

    /// Walks the heap chain and compares it with the allocator's accounting.
    ///
    /// # Errors
    ///
    /// Returns `CorruptMetadata` on any mismatch.
    pub fn verify_heap(&self) -> CoreResult<()> {
        self.heap.verify(&self.media)
    }

    /// Flushes the whole region.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn persist_all(&self) -> CoreResult<()> {
        self.media.persist_all()
    }

    /// Releases the pool and returns its region without flushing.
    #[must_use]
    pub fn into_region(self) -> Box<dyn PersistentMemory> {
        self.media.into_region()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("engine", &self.header.engine)
            .field("uuid", &self.header.uuid)
            .field("media", &self.media)
            .field("root", &self.root)
            .field("poisoned", &self.is_poisoned())
            .finish_non_exhaustive()
    }
}

/// Reads and validates the header of the pool in `region`.
///
/// # Errors
///
/// Returns `CorruptMetadata` if the region is too small or the header is
/// invalid, and `VersionMismatch` for an unsupported format.
pub fn read_header(region: &dyn PersistentMemory) -> CoreResult<PoolHeader> {
    if region.len() < HEADER_SIZE {
        return Err(CoreError::corrupt(format!(
            "region of {} bytes cannot hold a pool header",
            region.len()
        )));
    }
    let mut bytes = [0u8; ENCODED_LEN];
    region.read_at(0, &mut bytes)?;
    PoolHeader::decode(&bytes)
}

fn layout(size: u64, engine: EngineKind, tuning: &EngineTuning) -> CoreResult<PoolHeader> {
    let lanes_bytes = u64::from(tuning.lanes) * u64::from(tuning.lane_size);
    let heap_offset = (HEADER_SIZE + lanes_bytes).div_ceil(HEAP_ALIGN) * HEAP_ALIGN;
    let heap_size = size.saturating_sub(heap_offset) / 64 * 64;
    if heap_size < MIN_HEAP {
        return Err(CoreError::invalid_config(format!(
            "pool of {size} bytes leaves no room for a heap after {} lanes of {} bytes",
            tuning.lanes, tuning.lane_size
        )));
    }
    Ok(PoolHeader {
        major: FORMAT_MAJOR,
        minor: FORMAT_MINOR,
        engine,
        uuid: Uuid::new_v4(),
        pool_size: size,
        lane_count: tuning.lanes,
        lane_size: tuning.lane_size,
        heap_offset,
        heap_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmkv_pmem::VolatileRegion;
    use std::sync::Arc;

    const SIZE: u64 = 8 << 20;

    fn tuning() -> EngineTuning {
        EngineTuning {
            lanes: 4,
            lane_size: 8192,
            ..EngineTuning::default()
        }
    }

    fn create(region: Arc<VolatileRegion>, engine: EngineKind) -> Pool {
        Pool::create(Box::new(region), engine, &tuning(), true, |tx| tx.alloc(32)).unwrap()
    }

    fn image_of(region: &VolatileRegion) -> Box<dyn PersistentMemory> {
        Box::new(VolatileRegion::from_image(&region.image()).unwrap())
    }

    #[test]
    fn layout_places_heap_after_lanes() {
        let header = layout(SIZE, EngineKind::Radix, &tuning()).unwrap();
        assert_eq!(header.heap_offset, HEADER_SIZE + 4 * 8192);
        assert_eq!(header.heap_offset % HEAP_ALIGN, 0);
        assert!(header.heap_end() <= SIZE);
        assert!(header.check_layout(SIZE).is_ok());
    }

    #[test]
    fn layout_rejects_tiny_pools() {
        let big_lanes = EngineTuning {
            lanes: 128,
            lane_size: 64 * 1024,
            ..EngineTuning::default()
        };
        assert!(matches!(
            layout(SIZE, EngineKind::CMap, &big_lanes),
            Err(CoreError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn create_then_open() {
        let region = Arc::new(VolatileRegion::new(SIZE).unwrap());
        let pool = create(Arc::clone(&region), EngineKind::STree);
        let root = pool.root().unwrap();
        let uuid = pool.header().uuid;

        let reopened = Pool::open(image_of(&region), Some(EngineKind::STree), true).unwrap();
        assert_eq!(reopened.root().unwrap(), root);
        assert_eq!(reopened.header().uuid, uuid);
        assert_eq!(reopened.heap_stats().used_blocks, 1);
        assert!(reopened.verify_heap().is_ok());
    }

    #[test]
    fn engine_mismatch_refused() {
        let region = Arc::new(VolatileRegion::new(SIZE).unwrap());
        create(Arc::clone(&region), EngineKind::CMap);
        assert!(matches!(
            Pool::open(image_of(&region), Some(EngineKind::Radix), true),
            Err(CoreError::InvalidConfig { .. })
        ));
        assert!(Pool::open(image_of(&region), None, true).is_ok());
    }

    #[test]
    fn blank_region_is_not_a_pool() {
        let region = VolatileRegion::new(SIZE).unwrap();
        assert!(matches!(
            Pool::open(Box::new(region), None, true),
            Err(CoreError::CorruptMetadata { .. })
        ));
    }

    #[test]
    fn undersized_region_is_corrupt() {
        let region = VolatileRegion::new(1024).unwrap();
        assert!(matches!(
            read_header(&region),
            Err(CoreError::CorruptMetadata { .. })
        ));
    }

    #[test]
    fn failed_init_leaves_no_magic() {
        let region = Arc::new(VolatileRegion::new(SIZE).unwrap());
        let result = Pool::create(
            Box::new(Arc::clone(&region)),
            EngineKind::CMap,
            &tuning(),
            true,
            |_| Err(CoreError::OutOfSpace { requested: 1 }),
        );
        assert!(result.is_err());
        assert!(read_header(region.as_ref()).is_err());
    }

    #[test]
    fn poison_blocks_transactions() {
        let region = Arc::new(VolatileRegion::new(SIZE).unwrap());
        let pool = create(region, EngineKind::Radix);
        pool.poison();
        assert!(pool.is_poisoned());
        assert!(matches!(pool.begin(), Err(CoreError::StoreClosed)));
        assert!(matches!(pool.root(), Err(CoreError::StoreClosed)));
    }

    #[test]
    fn fail_point_fires_once() {
        let region = Arc::new(VolatileRegion::new(SIZE).unwrap());
        let pool = create(region, EngineKind::CMap);
        pool.arm_fail_point(Some(FailPoint::AfterCommit));
        assert!(!pool.take_fail_point(FailPoint::BeforeCommit));
        assert!(pool.take_fail_point(FailPoint::AfterCommit));
        assert!(!pool.take_fail_point(FailPoint::AfterCommit));
    }

    #[test]
    fn into_region_returns_the_bytes() {
        let region = Arc::new(VolatileRegion::new(SIZE).unwrap());
        let pool = create(region, EngineKind::CMap);
        let root = pool.root().unwrap();
        let region = pool.into_region();
        let reopened = Pool::open(region, None, false).unwrap();
        assert_eq!(reopened.root().unwrap(), root);
    }
}
