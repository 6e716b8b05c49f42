//! `cmap`: concurrent hash map.
//!
//! ```text
//! root block   [magic u64][bucket_count u64][buckets handle u64]
//! bucket array [head u64] * bucket_count
//! node         [next u64][record u64][hash u64]
//! ```
//!
//! The bucket count is fixed at creation and is a power of two. Buckets
//! share a volatile array of lock stripes, so operations on keys in
//! different stripes run in parallel. Iteration is unordered and visits
//! one bucket at a time. Records never move between buckets, so every
//! record present for the whole scan is visited at least once.

use super::{check_root, read_entry, zero_fresh, Index, IndexGuard};
use crate::config::EngineTuning;
use crate::error::{CoreError, CoreResult};
use crate::heap::MIN_BLOCK;
use crate::iter::{KeyRange, ScanMode, Visitor};
use crate::pool::Pool;
use crate::record;
use crate::transaction::Transaction;
use crate::types::{EngineKind, Handle};
use parking_lot::RwLock;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const CMAP_MAGIC: u64 = 0x5041_4d43_564b_4d50;
const ROOT_LEN: u64 = 24;
const NODE_LEN: u64 = 24;
const MAX_STRIPES: u64 = 1024;

fn key_hash(key: &[u8]) -> u64 {
    u64::from(crc32fast::hash(key))
}

/// Builds an empty map inside the pool creation transaction.
pub(crate) fn create(tx: &mut Transaction<'_>, tuning: &EngineTuning) -> CoreResult<Handle> {
    let buckets = tuning.buckets.next_power_of_two();
    let array = tx.alloc(buckets * 8)?;
    zero_fresh(tx, array.as_u64(), buckets * 8)?;

    let root = tx.alloc(ROOT_LEN)?;
    let mut buf = Vec::with_capacity(ROOT_LEN as usize);
    buf.extend_from_slice(&CMAP_MAGIC.to_le_bytes());
    buf.extend_from_slice(&buckets.to_le_bytes());
    buf.extend_from_slice(&array.as_u64().to_le_bytes());
    tx.write(root.as_u64(), &buf)?;
    Ok(root)
}

/// Opens the map rooted at `root`, counting its entries.
pub(crate) fn open(pool: Arc<Pool>, root: Handle) -> CoreResult<Box<dyn Index>> {
    check_root(&pool, root, CMAP_MAGIC, EngineKind::CMap)?;
    let buckets = pool.media().read_u64(root.at(8))?;
    let array = Handle::new(pool.media().read_u64(root.at(16))?);
    if buckets == 0 || !buckets.is_power_of_two() {
        return Err(CoreError::corrupt(format!(
            "cmap has invalid bucket count {buckets}"
        )));
    }
    pool.check_handle(array)?;

    let stripes = (0..buckets.min(MAX_STRIPES)).map(|_| RwLock::new(())).collect();
    let chain_limit = pool.header().heap_size / MIN_BLOCK;
    let map = CMap {
        pool,
        chain_limit,
        buckets: array,
        mask: buckets - 1,
        stripes,
        count: AtomicU64::new(0),
    };
    let mut count = 0u64;
    for bucket in 0..buckets {
        count += map.chain(bucket)?.len() as u64;
    }
    map.count.store(count, Ordering::Relaxed);
    tracing::debug!(buckets, entries = count, "cmap opened");
    Ok(Box::new(map))
}

/// A node of a bucket chain.
#[derive(Debug, Clone, Copy)]
struct Node {
    at: Handle,
    next: Handle,
    record: Handle,
    hash: u64,
}

pub(crate) struct CMap {
    pool: Arc<Pool>,
    buckets: Handle,
    mask: u64,
    /// Every node takes a block, so no chain is longer than the heap has blocks.
    chain_limit: u64,
    stripes: Vec<RwLock<()>>,
    count: AtomicU64,
}

impl CMap {
    fn bucket_of(&self, hash: u64) -> u64 {
        hash & self.mask
    }

    fn stripe(&self, bucket: u64) -> &RwLock<()> {
        &self.stripes[(bucket % self.stripes.len() as u64) as usize]
    }

    fn slot(&self, bucket: u64) -> u64 {
        self.buckets.at(bucket * 8)
    }

    fn read_node(&self, at: Handle) -> CoreResult<Node> {
        self.pool.check_handle(at)?;
        let media = self.pool.media();
        Ok(Node {
            at,
            next: Handle::new(media.read_u64(at.as_u64())?),
            record: Handle::new(media.read_u64(at.at(8))?),
            hash: media.read_u64(at.at(16))?,
        })
    }

    fn cycle_error(bucket: u64) -> CoreError {
        CoreError::corrupt(format!("cmap bucket {bucket} chain does not terminate"))
    }

    /// Reads a bucket's chain, failing on a cycle.
    fn chain(&self, bucket: u64) -> CoreResult<Vec<Node>> {
        let mut nodes = Vec::new();
        let mut at = Handle::new(self.pool.media().read_u64(self.slot(bucket))?);
        while !at.is_null() {
            if nodes.len() as u64 >= self.chain_limit {
                return Err(Self::cycle_error(bucket));
            }
            let node = self.read_node(at)?;
            at = node.next;
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// Finds the node holding `key` and the offset of the word pointing at it.
    fn locate(&self, key: &[u8]) -> CoreResult<(u64, Option<(u64, Node)>)> {
        let hash = key_hash(key);
        let bucket = self.bucket_of(hash);
        let mut link = self.slot(bucket);
        let mut at = Handle::new(self.pool.media().read_u64(link)?);
        let mut walked = 0u64;
        while !at.is_null() {
            if walked >= self.chain_limit {
                return Err(Self::cycle_error(bucket));
            }
            walked += 1;
            let node = self.read_node(at)?;
            if node.hash == hash && record::read_key(&self.pool, node.record)? == key {
                return Ok((bucket, Some((link, node))));
            }
            link = node.at.as_u64();
            at = node.next;
        }
        Ok((bucket, None))
    }
}

impl Index for CMap {
    fn kind(&self) -> EngineKind {
        EngineKind::CMap
    }

    fn read_guard(&self, key: &[u8]) -> IndexGuard<'_> {
        let bucket = self.bucket_of(key_hash(key));
        IndexGuard::Shared(self.stripe(bucket).read())
    }

    fn write_guard(&self, key: &[u8]) -> IndexGuard<'_> {
        let bucket = self.bucket_of(key_hash(key));
        IndexGuard::Exclusive(self.stripe(bucket).write())
    }

    fn find(&self, _guard: &IndexGuard<'_>, key: &[u8]) -> CoreResult<Option<Handle>> {
        Ok(self.locate(key)?.1.map(|(_, node)| node.record))
    }

    fn insert<'a>(
        &'a self,
        _guard: &IndexGuard<'_>,
        tx: &mut Transaction<'a>,
        key: &[u8],
        record: Handle,
    ) -> CoreResult<Option<Handle>> {
        let (bucket, found) = self.locate(key)?;
        if let Some((_, node)) = found {
            tx.write_u64(node.at.at(8), record.as_u64())?;
            return Ok(Some(node.record));
        }

        let slot = self.slot(bucket);
        let head = self.pool.media().read_u64(slot)?;
        let node = tx.alloc(NODE_LEN)?;
        let mut buf = Vec::with_capacity(NODE_LEN as usize);
        buf.extend_from_slice(&head.to_le_bytes());
        buf.extend_from_slice(&record.as_u64().to_le_bytes());
        buf.extend_from_slice(&key_hash(key).to_le_bytes());
        tx.write(node.as_u64(), &buf)?;
        tx.write_u64(slot, node.as_u64())?;

        let count = &self.count;
        tx.on_commit(move || {
            count.fetch_add(1, Ordering::Relaxed);
        });
        Ok(None)
    }

    fn erase<'a>(
        &'a self,
        _guard: &IndexGuard<'_>,
        tx: &mut Transaction<'a>,
        key: &[u8],
    ) -> CoreResult<Option<Handle>> {
        let Some((link, node)) = self.locate(key)?.1 else {
            return Ok(None);
        };
        tx.write_u64(link, node.next.as_u64())?;
        tx.free(node.at)?;

        let count = &self.count;
        tx.on_commit(move || {
            count.fetch_sub(1, Ordering::Relaxed);
        });
        Ok(Some(node.record))
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn scan(
        &self,
        range: &KeyRange<'_>,
        mode: ScanMode,
        visitor: &mut Visitor<'_>,
    ) -> CoreResult<ControlFlow<()>> {
        if !range.is_full() {
            return Err(CoreError::not_supported("range scan", "cmap"));
        }
        for bucket in 0..=self.mask {
            let entries = {
                let _stripe = self.stripe(bucket).read();
                self.chain(bucket)?
                    .iter()
                    .map(|node| read_entry(&self.pool, node.record, mode))
                    .collect::<CoreResult<Vec<_>>>()?
            };
            for (key, value) in &entries {
                if visitor(key, value).is_break() {
                    return Ok(ControlFlow::Break(()));
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn verify(&self) -> CoreResult<u64> {
        let mut found = 0u64;
        for bucket in 0..=self.mask {
            let _stripe = self.stripe(bucket).read();
            for node in self.chain(bucket)? {
                record::verify(&self.pool, node.record)?;
                let key = record::read_key(&self.pool, node.record)?;
                let hash = key_hash(&key);
                if hash != node.hash || self.bucket_of(hash) != bucket {
                    return Err(CoreError::corrupt(format!(
                        "cmap node {} sits in bucket {bucket} with a wrong hash",
                        node.at
                    )));
                }
                found += 1;
            }
        }
        if found != self.count() {
            return Err(CoreError::corrupt(format!(
                "cmap holds {found} entries but counts {}",
                self.count()
            )));
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmkv_pmem::VolatileRegion;

    fn tuning(buckets: u64) -> EngineTuning {
        EngineTuning {
            buckets,
            lanes: 4,
            lane_size: 16 * 1024,
            ..EngineTuning::default()
        }
    }

    fn new_map(buckets: u64) -> (Arc<Pool>, Box<dyn Index>) {
        let tuning = tuning(buckets);
        let pool = Pool::create(
            Box::new(VolatileRegion::new(8 << 20).unwrap()),
            EngineKind::CMap,
            &tuning,
            true,
            |tx| create(tx, &tuning),
        )
        .unwrap();
        let pool = Arc::new(pool);
        let root = pool.root().unwrap();
        let index = open(Arc::clone(&pool), root).unwrap();
        (pool, index)
    }

    fn put(pool: &Pool, index: &dyn Index, key: &[u8], value: &[u8]) -> Option<Handle> {
        let guard = index.write_guard(key);
        let mut tx = pool.begin().unwrap();
        let rec = record::create(&mut tx, key, value).unwrap();
        let old = index.insert(&guard, &mut tx, key, rec).unwrap();
        if let Some(old) = old {
            tx.free(old).unwrap();
        }
        tx.commit().unwrap();
        old
    }

    fn get(pool: &Pool, index: &dyn Index, key: &[u8]) -> Option<Vec<u8>> {
        let guard = index.read_guard(key);
        index
            .find(&guard, key)
            .unwrap()
            .map(|h| record::read_value(pool, h).unwrap())
    }

    fn remove(pool: &Pool, index: &dyn Index, key: &[u8]) -> bool {
        let guard = index.write_guard(key);
        let mut tx = pool.begin().unwrap();
        let old = index.erase(&guard, &mut tx, key).unwrap();
        if let Some(old) = old {
            tx.free(old).unwrap();
        }
        tx.commit().unwrap();
        old.is_some()
    }

    #[test]
    fn bucket_count_rounds_up() {
        let (pool, _) = new_map(100);
        let root = pool.root().unwrap();
        assert_eq!(pool.media().read_u64(root.at(8)).unwrap(), 128);
    }

    #[test]
    fn insert_find_replace_erase() {
        // two buckets force chains
        let (pool, index) = new_map(2);
        for i in 0..50u32 {
            assert!(put(&pool, index.as_ref(), format!("k{i}").as_bytes(), &i.to_le_bytes()).is_none());
        }
        assert_eq!(index.count(), 50);
        assert_eq!(get(&pool, index.as_ref(), b"k7").unwrap(), 7u32.to_le_bytes());

        assert!(put(&pool, index.as_ref(), b"k7", b"seven").is_some());
        assert_eq!(index.count(), 50);
        assert_eq!(get(&pool, index.as_ref(), b"k7").unwrap(), b"seven");

        assert!(remove(&pool, index.as_ref(), b"k7"));
        assert!(!remove(&pool, index.as_ref(), b"k7"));
        assert_eq!(get(&pool, index.as_ref(), b"k7"), None);
        assert_eq!(index.count(), 49);
        assert_eq!(index.verify().unwrap(), 49);
    }

    #[test]
    fn aborted_insert_changes_nothing() {
        let (pool, index) = new_map(16);
        put(&pool, index.as_ref(), b"a", b"1");
        {
            let guard = index.write_guard(b"b");
            let mut tx = pool.begin().unwrap();
            let rec = record::create(&mut tx, b"b", b"2").unwrap();
            index.insert(&guard, &mut tx, b"b", rec).unwrap();
            tx.abort().unwrap();
        }
        assert_eq!(index.count(), 1);
        assert_eq!(get(&pool, index.as_ref(), b"b"), None);
        assert_eq!(index.verify().unwrap(), 1);
    }

    #[test]
    fn scan_visits_everything_and_refuses_ranges() {
        let (pool, index) = new_map(8);
        for i in 0..20u32 {
            put(&pool, index.as_ref(), &i.to_be_bytes(), b"v");
        }
        let mut seen = Vec::new();
        index
            .scan(&KeyRange::all(), ScanMode::KeysOnly, &mut |k: &[u8], v: &[u8]| {
                assert!(v.is_empty());
                seen.push(k.to_vec());
                ControlFlow::Continue(())
            })
            .unwrap();
        seen.sort();
        assert_eq!(seen, (0..20u32).map(|i| i.to_be_bytes().to_vec()).collect::<Vec<_>>());

        let err = index
            .scan(&KeyRange::above(b"a"), ScanMode::Pairs, &mut |_: &[u8], _: &[u8]| {
                ControlFlow::Continue(())
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::NotSupported { .. }));
    }

    #[test]
    fn reopen_recounts() {
        let region = Arc::new(VolatileRegion::new(8 << 20).unwrap());
        let tuning = tuning(4);
        let pool = Arc::new(
            Pool::create(Box::new(Arc::clone(&region)), EngineKind::CMap, &tuning, true, |tx| {
                create(tx, &tuning)
            })
            .unwrap(),
        );
        let index = open(Arc::clone(&pool), pool.root().unwrap()).unwrap();
        for key in [b"x".as_slice(), b"y", b"z"] {
            put(&pool, index.as_ref(), key, b"v");
        }
        drop(index);
        drop(pool);

        let image = VolatileRegion::from_image(&region.image()).unwrap();
        let pool = Arc::new(Pool::open(Box::new(image), Some(EngineKind::CMap), true).unwrap());
        let index = open(Arc::clone(&pool), pool.root().unwrap()).unwrap();
        assert_eq!(index.count(), 3);
        assert_eq!(get(&pool, index.as_ref(), b"y").unwrap(), b"v");
    }

    #[test]
    fn cyclic_chain_is_corrupt() {
        let (pool, index) = new_map(1);
        put(&pool, index.as_ref(), b"a", b"1");
        let root = pool.root().unwrap();
        let array = pool.media().read_u64(root.at(16)).unwrap();
        let head = pool.media().read_u64(array).unwrap();
        // point the node at itself
        pool.media().write_u64(head, head).unwrap();
        assert!(matches!(
            open(Arc::clone(&pool), root),
            Err(CoreError::CorruptMetadata { .. })
        ));
    }

    #[test]
    fn cyclic_chain_fails_live_lookups() {
        let (pool, index) = new_map(1);
        put(&pool, index.as_ref(), b"a", b"1");
        put(&pool, index.as_ref(), b"b", b"2");
        let root = pool.root().unwrap();
        let array = pool.media().read_u64(root.at(16)).unwrap();
        let head = pool.media().read_u64(array).unwrap();
        let second = pool.media().read_u64(head).unwrap();
        // close the chain into a loop behind the open map
        pool.media().write_u64(second, head).unwrap();

        let guard = index.read_guard(b"missing");
        assert!(matches!(
            index.find(&guard, b"missing"),
            Err(CoreError::CorruptMetadata { .. })
        ));
        drop(guard);

        let err = index
            .scan(&KeyRange::all(), ScanMode::KeysOnly, &mut |_: &[u8], _: &[u8]| {
                ControlFlow::Continue(())
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::CorruptMetadata { .. }));
    }
}
