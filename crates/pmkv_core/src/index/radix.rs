//! `radix`: path-compressed 16-way trie.
//!
//! Keys are read as sequences of 4-bit nibbles, high nibble first. Each
//! inner node branches on one nibble position and skips every position
//! where its keys agree:
//!
//! ```text
//! root block [magic u64][root slot u64]
//! node       [depth u64][leaf slot u64][child slot u64 * 16]
//! ```
//!
//! `depth` is the nibble index the node branches on; all keys below the
//! node share their first `depth` nibbles. The leaf slot holds the key that
//! ends exactly at `depth`. A slot is empty (0), a node handle, or a record
//! handle tagged with the low bit. Every node holds at least two items.
//!
//! Updates happen in place under the tree write lock inside a transaction,
//! so readers wait for each write to commit.
//! In-order traversal (leaf slot first, then children 0 to 15) yields
//! byte-lexicographic key order.

use super::{check_root, read_entry, Index, IndexGuard};
use crate::config::EngineTuning;
use crate::error::{CoreError, CoreResult};
use crate::iter::{drive_batches, Entry, KeyRange, ScanMode, Visitor, SCAN_BATCH};
use crate::pool::Pool;
use crate::record;
use crate::transaction::Transaction;
use crate::types::{EngineKind, Handle};
use parking_lot::RwLock;
use std::cmp::Ordering as KeyOrdering;
use std::ops::{Bound, ControlFlow};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const RADIX_MAGIC: u64 = 0x5844_5252_564b_4d50;
const ROOT_LEN: u64 = 16;
const FANOUT: usize = 16;
const NODE_LEN: u64 = 16 + 8 * FANOUT as u64;
const LEAF_TAG: u64 = 1;

fn nibble_len(key: &[u8]) -> u64 {
    key.len() as u64 * 2
}

fn nibble(key: &[u8], at: u64) -> usize {
    let byte = key[(at / 2) as usize];
    usize::from(if at % 2 == 0 { byte >> 4 } else { byte & 0x0f })
}

/// First nibble position where `a` and `b` differ, or the shorter length.
fn first_difference(a: &[u8], b: &[u8]) -> u64 {
    let n = nibble_len(a).min(nibble_len(b));
    (0..n).find(|&i| nibble(a, i) != nibble(b, i)).unwrap_or(n)
}

/// Compares the first `prefix` nibbles of `key` with `bound`, stopping at
/// the end of the shorter one.
fn compare_prefix(key: &[u8], prefix: u64, bound: &[u8]) -> KeyOrdering {
    let n = prefix.min(nibble_len(bound));
    (0..n)
        .map(|i| nibble(key, i).cmp(&nibble(bound, i)))
        .find(|ord| ord.is_ne())
        .unwrap_or(KeyOrdering::Equal)
}

const fn is_leaf(slot: u64) -> bool {
    slot & LEAF_TAG != 0
}

const fn leaf_record(slot: u64) -> Handle {
    Handle::new(slot & !LEAF_TAG)
}

const fn tag_leaf(record: Handle) -> u64 {
    record.as_u64() | LEAF_TAG
}

/// Builds an empty trie inside the pool creation transaction.
pub(crate) fn create(tx: &mut Transaction<'_>, _tuning: &EngineTuning) -> CoreResult<Handle> {
    let root = tx.alloc(ROOT_LEN)?;
    let mut buf = Vec::with_capacity(ROOT_LEN as usize);
    buf.extend_from_slice(&RADIX_MAGIC.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());
    tx.write(root.as_u64(), &buf)?;
    Ok(root)
}

/// Opens the trie rooted at `root`, counting its entries.
pub(crate) fn open(pool: Arc<Pool>, root: Handle) -> CoreResult<Box<dyn Index>> {
    check_root(&pool, root, RADIX_MAGIC, EngineKind::Radix)?;
    let tree = Radix {
        pool,
        root_slot: root.at(8),
        tree: RwLock::new(()),
        count: AtomicU64::new(0),
    };
    let mut count = 0u64;
    tree.walk(|_| {
        count += 1;
        Ok(())
    })?;
    tree.count.store(count, Ordering::Relaxed);
    tracing::debug!(entries = count, "radix opened");
    Ok(Box::new(tree))
}

#[derive(Debug, Clone, Copy)]
struct Node {
    at: Handle,
    depth: u64,
    leaf: u64,
    children: [u64; FANOUT],
}

impl Node {
    fn leaf_offset(&self) -> u64 {
        self.at.at(8)
    }

    fn child_offset(&self, index: usize) -> u64 {
        self.at.at(16 + 8 * index as u64)
    }

    fn items(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        std::iter::once((self.leaf_offset(), self.leaf))
            .chain((0..FANOUT).map(|i| (self.child_offset(i), self.children[i])))
            .filter(|(_, slot)| *slot != 0)
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(NODE_LEN as usize);
        buf.extend_from_slice(&self.depth.to_le_bytes());
        buf.extend_from_slice(&self.leaf.to_le_bytes());
        for child in self.children {
            buf.extend_from_slice(&child.to_le_bytes());
        }
        buf
    }
}

/// Where a key was found.
struct Located {
    slot: u64,
    record: Handle,
    /// The node holding `slot` and the offset of the slot pointing at it.
    parent: Option<(Node, u64)>,
}

/// One pending step of an ordered walk.
#[derive(Clone, Copy)]
struct Frame {
    slot: u64,
    /// The walk is still on the lower bound's path.
    lower_tight: bool,
    /// The walk is still on the upper bound's path.
    upper_tight: bool,
}

/// The trie engine.
///
/// One tree-wide lock covers every node: a writer excludes all readers for
/// the whole of its transaction, while readers share it. `cmap` stripes its
/// locks and `stree` readers never wait, so write-heavy mixed loads favor
/// those engines.
pub(crate) struct Radix {
    pool: Arc<Pool>,
    root_slot: u64,
    /// Shared by lookups and scan batches, exclusive for inserts and erases.
    tree: RwLock<()>,
    count: AtomicU64,
}

impl Radix {
    fn read_slot(&self, offset: u64) -> CoreResult<u64> {
        self.pool.media().read_u64(offset)
    }

    fn read_node(&self, slot: u64) -> CoreResult<Node> {
        let at = Handle::new(slot);
        self.pool.check_handle(at)?;
        let bytes = self.pool.media().read_vec(at.as_u64(), NODE_LEN as usize)?;
        let word = |i: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            u64::from_le_bytes(w)
        };
        let mut children = [0u64; FANOUT];
        for (i, child) in children.iter_mut().enumerate() {
            *child = word(2 + i);
        }
        Ok(Node {
            at,
            depth: word(0),
            leaf: word(1),
            children,
        })
    }

    fn leaf_key(&self, slot: u64) -> CoreResult<Vec<u8>> {
        record::read_key(&self.pool, leaf_record(slot))
    }

    /// Returns some leaf below `slot`.
    fn any_leaf(&self, mut slot: u64) -> CoreResult<u64> {
        loop {
            if is_leaf(slot) {
                return Ok(slot);
            }
            let node = self.read_node(slot)?;
            slot = node.items().map(|(_, item)| item).next().ok_or_else(|| {
                CoreError::corrupt(format!("radix node {} is empty", node.at))
            })?;
        }
    }

    fn locate(&self, key: &[u8]) -> CoreResult<Option<Located>> {
        let len = nibble_len(key);
        let mut offset = self.root_slot;
        let mut parent = None;
        loop {
            let slot = self.read_slot(offset)?;
            if slot == 0 {
                return Ok(None);
            }
            if is_leaf(slot) {
                if self.leaf_key(slot)? != key {
                    return Ok(None);
                }
                return Ok(Some(Located {
                    slot: offset,
                    record: leaf_record(slot),
                    parent,
                }));
            }
            let node = self.read_node(slot)?;
            let next = match len.cmp(&node.depth) {
                KeyOrdering::Less => return Ok(None),
                KeyOrdering::Equal => node.leaf_offset(),
                KeyOrdering::Greater => node.child_offset(nibble(key, node.depth)),
            };
            parent = Some((node, offset));
            offset = next;
        }
    }

    /// Finds a leaf sharing the longest prefix with `key` reachable along its path.
    fn candidate(&self, key: &[u8]) -> CoreResult<u64> {
        let len = nibble_len(key);
        let mut slot = self.read_slot(self.root_slot)?;
        loop {
            if is_leaf(slot) {
                return Ok(slot);
            }
            let node = self.read_node(slot)?;
            if len > node.depth {
                let child = node.children[nibble(key, node.depth)];
                if child != 0 {
                    slot = child;
                    continue;
                }
            } else if len == node.depth && node.leaf != 0 {
                return Ok(node.leaf);
            }
            return self.any_leaf(slot);
        }
    }

    fn link_new(&self, tx: &mut Transaction<'_>, key: &[u8], record: Handle) -> CoreResult<()> {
        let leaf = tag_leaf(record);
        if self.read_slot(self.root_slot)? == 0 {
            return tx.write_u64(self.root_slot, leaf);
        }

        let other = self.leaf_key(self.candidate(key)?)?;
        let diff = first_difference(key, &other);
        let len = nibble_len(key);

        let mut offset = self.root_slot;
        let existing = loop {
            let slot = self.read_slot(offset)?;
            if slot == 0 || is_leaf(slot) {
                break slot;
            }
            let node = self.read_node(slot)?;
            match node.depth.cmp(&diff) {
                KeyOrdering::Less => offset = node.child_offset(nibble(key, node.depth)),
                KeyOrdering::Equal => {
                    let target = if len == diff {
                        node.leaf_offset()
                    } else {
                        node.child_offset(nibble(key, diff))
                    };
                    if self.read_slot(target)? != 0 {
                        return Err(CoreError::corrupt(format!(
                            "radix node {} already holds the slot for a new key",
                            node.at
                        )));
                    }
                    return tx.write_u64(target, leaf);
                }
                KeyOrdering::Greater => break slot,
            }
        };
        if existing == 0 {
            return tx.write_u64(offset, leaf);
        }

        // split: a new node at `diff` takes the existing subtree and the new leaf
        let mut node = Node {
            at: tx.alloc(NODE_LEN)?,
            depth: diff,
            leaf: 0,
            children: [0; FANOUT],
        };
        let sample = self.leaf_key(self.any_leaf(existing)?)?;
        if nibble_len(&sample) == diff {
            node.leaf = existing;
        } else {
            node.children[nibble(&sample, diff)] = existing;
        }
        if len == diff {
            node.leaf = leaf;
        } else {
            node.children[nibble(key, diff)] = leaf;
        }
        tx.write(node.at.as_u64(), &node.encode())?;
        tx.write_u64(offset, node.at.as_u64())
    }

    /// Visits every leaf in key order.
    fn walk(&self, mut visit: impl FnMut(u64) -> CoreResult<()>) -> CoreResult<()> {
        let mut stack = vec![(self.read_slot(self.root_slot)?, 0u64)];
        while let Some((slot, min_depth)) = stack.pop() {
            if slot == 0 {
                continue;
            }
            if is_leaf(slot) {
                visit(slot)?;
                continue;
            }
            let node = self.read_node(slot)?;
            if node.depth < min_depth {
                return Err(CoreError::corrupt(format!(
                    "radix node {} branches at {} above its parent",
                    node.at, node.depth
                )));
            }
            if node.items().count() < 2 {
                return Err(CoreError::corrupt(format!(
                    "radix node {} holds fewer than two items",
                    node.at
                )));
            }
            for child in node.children.iter().rev() {
                stack.push((*child, node.depth + 1));
            }
            if node.leaf != 0 && !is_leaf(node.leaf) {
                return Err(CoreError::corrupt(format!(
                    "radix node {} has a node in its leaf slot",
                    node.at
                )));
            }
            stack.push((node.leaf, node.depth));
        }
        Ok(())
    }

    /// Collects up to `SCAN_BATCH` entries of `range` in key order.
    fn collect(&self, range: &KeyRange<'_>, mode: ScanMode) -> CoreResult<Vec<Entry>> {
        let _tree = self.tree.read();
        let mut out = Vec::new();
        let mut stack = vec![Frame {
            slot: self.read_slot(self.root_slot)?,
            lower_tight: !matches!(range.lower, Bound::Unbounded),
            upper_tight: !matches!(range.upper, Bound::Unbounded),
        }];

        while let Some(frame) = stack.pop() {
            if frame.slot == 0 {
                continue;
            }
            if is_leaf(frame.slot) {
                let key = self.leaf_key(frame.slot)?;
                if !range.before_upper(&key) {
                    break;
                }
                if range.after_lower(&key) {
                    out.push(read_entry(&self.pool, leaf_record(frame.slot), mode)?);
                    if out.len() >= SCAN_BATCH {
                        break;
                    }
                }
                continue;
            }

            let node = self.read_node(frame.slot)?;
            let mut next = frame;
            if frame.lower_tight || frame.upper_tight {
                let sample = self.leaf_key(self.any_leaf(frame.slot)?)?;
                if let Bound::Included(low) | Bound::Excluded(low) = range.lower {
                    if frame.lower_tight {
                        match compare_prefix(&sample, node.depth, low) {
                            KeyOrdering::Less => continue,
                            KeyOrdering::Greater => next.lower_tight = false,
                            KeyOrdering::Equal => {}
                        }
                    }
                }
                if let Bound::Included(high) | Bound::Excluded(high) = range.upper {
                    if frame.upper_tight {
                        match compare_prefix(&sample, node.depth, high) {
                            KeyOrdering::Greater => break,
                            KeyOrdering::Less => next.upper_tight = false,
                            KeyOrdering::Equal => {}
                        }
                    }
                }
            }
            for child in node.children.iter().rev() {
                stack.push(Frame {
                    slot: *child,
                    ..next
                });
            }
            stack.push(Frame {
                slot: node.leaf,
                ..next
            });
        }
        Ok(out)
    }
}

impl Index for Radix {
    fn kind(&self) -> EngineKind {
        EngineKind::Radix
    }

    fn read_guard(&self, _key: &[u8]) -> IndexGuard<'_> {
        IndexGuard::Shared(self.tree.read())
    }

    fn write_guard(&self, _key: &[u8]) -> IndexGuard<'_> {
        IndexGuard::Exclusive(self.tree.write())
    }

    fn find(&self, _guard: &IndexGuard<'_>, key: &[u8]) -> CoreResult<Option<Handle>> {
        Ok(self.locate(key)?.map(|found| found.record))
    }

    fn insert<'a>(
        &'a self,
        _guard: &IndexGuard<'_>,
        tx: &mut Transaction<'a>,
        key: &[u8],
        record: Handle,
    ) -> CoreResult<Option<Handle>> {
        if let Some(found) = self.locate(key)? {
            tx.write_u64(found.slot, tag_leaf(record))?;
            return Ok(Some(found.record));
        }
        self.link_new(tx, key, record)?;
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
        let Some(found) = self.locate(key)? else {
            return Ok(None);
        };
        tx.write_u64(found.slot, 0)?;

        if let Some((node, parent_slot)) = found.parent {
            let mut remaining = node.items().filter(|(offset, _)| *offset != found.slot);
            let first = remaining.next();
            if remaining.next().is_none() {
                // a single item is pulled up into the parent slot
                let item = first.map_or(0, |(_, item)| item);
                tx.write_u64(parent_slot, item)?;
                tx.free(node.at)?;
            }
        }

        let count = &self.count;
        tx.on_commit(move || {
            count.fetch_sub(1, Ordering::Relaxed);
        });
        Ok(Some(found.record))
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
        drive_batches(range, visitor, |current| self.collect(current, mode))
    }

    fn verify(&self) -> CoreResult<u64> {
        let _tree = self.tree.read();
        let mut previous: Option<Vec<u8>> = None;
        let mut found = 0u64;
        self.walk(|slot| {
            let record = leaf_record(slot);
            record::verify(&self.pool, record)?;
            let key = record::read_key(&self.pool, record)?;
            if previous.as_ref().is_some_and(|prev| *prev >= key) {
                return Err(CoreError::corrupt(format!(
                    "radix keys out of order at record {record}"
                )));
            }
            previous = Some(key);
            found += 1;
            Ok(())
        })?;
        if found != self.count() {
            return Err(CoreError::corrupt(format!(
                "radix holds {found} entries but counts {}",
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
    use std::collections::BTreeMap;

    fn new_tree() -> (Arc<Pool>, Box<dyn Index>) {
        let tuning = EngineTuning {
            lanes: 4,
            lane_size: 16 * 1024,
            ..EngineTuning::default()
        };
        let pool = Pool::create(
            Box::new(VolatileRegion::new(16 << 20).unwrap()),
            EngineKind::Radix,
            &tuning,
            true,
            |tx| create(tx, &tuning),
        )
        .unwrap();
        let pool = Arc::new(pool);
        let index = open(Arc::clone(&pool), pool.root().unwrap()).unwrap();
        (pool, index)
    }

    fn put(pool: &Pool, index: &dyn Index, key: &[u8], value: &[u8]) {
        let guard = index.write_guard(key);
        let mut tx = pool.begin().unwrap();
        let rec = record::create(&mut tx, key, value).unwrap();
        if let Some(old) = index.insert(&guard, &mut tx, key, rec).unwrap() {
            tx.free(old).unwrap();
        }
        tx.commit().unwrap();
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

    fn keys(index: &dyn Index, range: &KeyRange<'_>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        index
            .scan(range, ScanMode::KeysOnly, &mut |k: &[u8], _: &[u8]| {
                out.push(k.to_vec());
                ControlFlow::Continue(())
            })
            .unwrap();
        out
    }

    #[test]
    fn nibble_helpers() {
        assert_eq!(nibble(&[0xAB], 0), 0xA);
        assert_eq!(nibble(&[0xAB], 1), 0xB);
        assert_eq!(first_difference(b"abc", b"abd"), 5);
        assert_eq!(first_difference(b"ab", b"abc"), 4);
        assert_eq!(compare_prefix(b"abc", 4, b"abz"), KeyOrdering::Equal);
        assert_eq!(compare_prefix(b"abc", 6, b"abz"), KeyOrdering::Less);
        assert_eq!(compare_prefix(b"b", 2, b"abz"), KeyOrdering::Greater);
    }

    #[test]
    fn prefixes_and_shared_paths() {
        let (pool, index) = new_tree();
        let words: [&[u8]; 8] = [b"a", b"ab", b"abc", b"abd", b"b", b"ba", b"\x00", b"\xff\xff"];
        for (i, word) in words.iter().enumerate() {
            put(&pool, index.as_ref(), word, &[i as u8]);
        }
        assert_eq!(index.count(), 8);
        for (i, word) in words.iter().enumerate() {
            let guard = index.read_guard(word);
            let rec = index.find(&guard, word).unwrap().unwrap();
            assert_eq!(record::read_value(&pool, rec).unwrap(), vec![i as u8]);
        }
        let guard = index.read_guard(b"abe");
        assert!(index.find(&guard, b"abe").unwrap().is_none());
        assert!(index.find(&guard, b"").unwrap().is_none());
        drop(guard);

        let mut sorted: Vec<Vec<u8>> = words.iter().map(|w| w.to_vec()).collect();
        sorted.sort();
        assert_eq!(keys(index.as_ref(), &KeyRange::all()), sorted);
        assert_eq!(index.verify().unwrap(), 8);
    }

    #[test]
    fn erase_collapses_nodes() {
        let (pool, index) = new_tree();
        for key in [b"abc".as_slice(), b"abd", b"ab"] {
            put(&pool, index.as_ref(), key, b"v");
        }
        let used = pool.heap_stats().used_blocks;
        assert!(remove(&pool, index.as_ref(), b"abd"));
        // record and the node branching on "abc"/"abd" are gone
        assert_eq!(pool.heap_stats().used_blocks, used - 2);
        assert!(remove(&pool, index.as_ref(), b"ab"));
        assert!(!remove(&pool, index.as_ref(), b"ab"));
        assert_eq!(keys(index.as_ref(), &KeyRange::all()), vec![b"abc".to_vec()]);
        assert!(remove(&pool, index.as_ref(), b"abc"));
        assert_eq!(index.count(), 0);
        assert_eq!(pool.media().read_u64(pool.root().unwrap().at(8)).unwrap(), 0);
        assert_eq!(index.verify().unwrap(), 0);
    }

    #[test]
    fn ranges_match_model_across_batches() {
        let (pool, index) = new_tree();
        let mut model = BTreeMap::new();
        for i in 0..700u32 {
            let key = format!("user:{:04}", i * 7 % 1000).into_bytes();
            put(&pool, index.as_ref(), &key, b"");
            model.insert(key, ());
        }
        let low = b"user:0300".as_slice();
        let high = b"user:0650".as_slice();
        let cases = [
            KeyRange::all(),
            KeyRange::above(low),
            KeyRange::equal_above(low),
            KeyRange::below(high),
            KeyRange::equal_below(high),
            KeyRange::between(low, high),
            KeyRange::above(b"user:05"),
            KeyRange::below(b"user:"),
        ];
        for range in cases {
            let expected: Vec<Vec<u8>> = model
                .range::<[u8], _>((range.lower, range.upper))
                .map(|(k, _)| k.clone())
                .collect();
            assert_eq!(keys(index.as_ref(), &range), expected, "{range:?}");
        }
    }

    #[test]
    fn replace_keeps_count() {
        let (pool, index) = new_tree();
        put(&pool, index.as_ref(), b"key", b"one");
        put(&pool, index.as_ref(), b"key", b"two");
        assert_eq!(index.count(), 1);
        let guard = index.read_guard(b"key");
        let rec = index.find(&guard, b"key").unwrap().unwrap();
        assert_eq!(record::read_value(&pool, rec).unwrap(), b"two");
    }

    #[test]
    fn writer_excludes_readers_of_other_keys() {
        use std::sync::atomic::AtomicBool;
        use std::time::Duration;

        let (pool, index) = new_tree();
        put(&pool, index.as_ref(), b"zzz", b"1");
        let index = index.as_ref();
        let read = AtomicBool::new(false);

        std::thread::scope(|scope| {
            let guard = index.write_guard(b"aaa");
            let reader = scope.spawn(|| {
                let guard = index.read_guard(b"zzz");
                let found = index.find(&guard, b"zzz").unwrap();
                read.store(true, std::sync::atomic::Ordering::SeqCst);
                found
            });
            std::thread::sleep(Duration::from_millis(50));
            assert!(!read.load(std::sync::atomic::Ordering::SeqCst));
            drop(guard);
            assert!(reader.join().unwrap().is_some());
        });
        assert!(read.into_inner());
    }
}
