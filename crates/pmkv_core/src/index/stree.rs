//! `stree`: copy-on-write B+ tree.
//!
//! ```text
//! root block  [magic u64][root node u64][degree u64]
//! leaf node   [kind=1 u64][count u64][record u64 * degree]
//! inner node  [kind=2 u64][count u64][separator u64 * (degree-1)][child u64 * degree]
//! ```
//!
//! `count` is the number of records in a leaf and the number of children
//! in an inner node. Separators are records with an empty value; child `i`
//! holds keys `k` with `separator[i-1] <= k < separator[i]`.
//!
//! Writers are serialized by one mutex. A write copies every node on the
//! path it changes, frees the old ones in the same transaction, and points
//! the root block at the new root. Readers follow the volatile published
//! root and never see a half-built path. After the transaction commits the
//! new root is published under a short exclusive lock, which also waits for
//! readers still walking the old path before its nodes become reusable.
//!
//! Underfull nodes are not merged. An emptied child is removed together
//! with one separator and a root with a single child is collapsed.

use super::{check_root, read_entry, Index, IndexGuard};
use crate::config::EngineTuning;
use crate::error::{CoreError, CoreResult};
use crate::iter::{drive_batches, Entry, KeyRange, ScanMode, Visitor, SCAN_BATCH};
use crate::pool::Pool;
use crate::record;
use crate::transaction::Transaction;
use crate::types::{EngineKind, Handle};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering as KeyOrdering;
use std::ops::{Bound, ControlFlow};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const STREE_MAGIC: u64 = 0x4545_5254_564b_4d50;
const ROOT_LEN: u64 = 24;
const KIND_LEAF: u64 = 1;
const KIND_INNER: u64 = 2;
const MIN_DEGREE: u64 = 4;
const MAX_DEGREE: u64 = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Leaf(Vec<Handle>),
    Inner {
        separators: Vec<Handle>,
        children: Vec<Handle>,
    },
}

fn leaf_len(degree: usize) -> u64 {
    16 + 8 * degree as u64
}

fn inner_len(degree: usize) -> u64 {
    16 + 8 * (2 * degree as u64 - 1)
}

fn write_node(tx: &mut Transaction<'_>, degree: usize, node: &Node) -> CoreResult<Handle> {
    let (kind, len, words): (u64, u64, Vec<Handle>) = match node {
        Node::Leaf(records) => (KIND_LEAF, leaf_len(degree), records.clone()),
        Node::Inner {
            separators,
            children,
        } => {
            let mut words = separators.clone();
            words.resize(degree - 1, Handle::NULL);
            words.extend_from_slice(children);
            (KIND_INNER, inner_len(degree), words)
        }
    };
    let count = match node {
        Node::Leaf(records) => records.len(),
        Node::Inner { children, .. } => children.len(),
    };

    let mut buf = Vec::with_capacity(len as usize);
    buf.extend_from_slice(&kind.to_le_bytes());
    buf.extend_from_slice(&(count as u64).to_le_bytes());
    for word in words {
        buf.extend_from_slice(&word.as_u64().to_le_bytes());
    }
    buf.resize(len as usize, 0);

    let handle = tx.alloc(len)?;
    tx.write(handle.as_u64(), &buf)?;
    Ok(handle)
}

/// Builds an empty tree inside the pool creation transaction.
pub(crate) fn create(tx: &mut Transaction<'_>, tuning: &EngineTuning) -> CoreResult<Handle> {
    let degree = tuning.degree as usize;
    let leaf = write_node(tx, degree, &Node::Leaf(Vec::new()))?;
    let root = tx.alloc(ROOT_LEN)?;
    let mut buf = Vec::with_capacity(ROOT_LEN as usize);
    buf.extend_from_slice(&STREE_MAGIC.to_le_bytes());
    buf.extend_from_slice(&leaf.as_u64().to_le_bytes());
    buf.extend_from_slice(&(degree as u64).to_le_bytes());
    tx.write(root.as_u64(), &buf)?;
    Ok(root)
}

/// Opens the tree rooted at `root`, counting its entries.
pub(crate) fn open(pool: Arc<Pool>, root: Handle) -> CoreResult<Box<dyn Index>> {
    check_root(&pool, root, STREE_MAGIC, EngineKind::STree)?;
    let node = pool.media().read_u64(root.at(8))?;
    let degree = pool.media().read_u64(root.at(16))?;
    if !(MIN_DEGREE..=MAX_DEGREE).contains(&degree) {
        return Err(CoreError::corrupt(format!(
            "stree has invalid degree {degree}"
        )));
    }
    let tree = STree {
        pool,
        root_block: root,
        degree: degree as usize,
        root: AtomicU64::new(node),
        count: AtomicU64::new(0),
        writer: Mutex::new(()),
        publish: RwLock::new(()),
    };
    let count = tree.count_entries(Handle::new(node), 0, &mut None)?;
    tree.count.store(count, Ordering::Relaxed);
    tracing::debug!(degree, entries = count, "stree opened");
    Ok(Box::new(tree))
}

/// Result of inserting below a node.
enum Inserted {
    /// The key existed; the copied node holds the new record.
    Replaced { node: Handle, old: Handle },
    /// A new key fit into the copied node.
    Added(Handle),
    /// The node overflowed into two.
    Split {
        left: Handle,
        separator: Handle,
        right: Handle,
    },
}

/// Result of erasing below a node.
enum Erased {
    Node(Handle),
    Empty,
}

pub(crate) struct STree {
    pool: Arc<Pool>,
    root_block: Handle,
    degree: usize,
    /// Root readers follow; only moved by commit hooks.
    root: AtomicU64,
    count: AtomicU64,
    writer: Mutex<()>,
    publish: RwLock<()>,
}

impl STree {
    fn read_node(&self, handle: Handle) -> CoreResult<Node> {
        self.pool.check_handle(handle)?;
        let media = self.pool.media();
        let kind = media.read_u64(handle.as_u64())?;
        let count = media.read_u64(handle.at(8))?;
        let words = |from: u64, n: u64| -> CoreResult<Vec<Handle>> {
            let bytes = media.read_vec(handle.at(16 + 8 * from), (8 * n) as usize)?;
            Ok(bytes
                .chunks_exact(8)
                .map(|chunk| {
                    let mut word = [0u8; 8];
                    word.copy_from_slice(chunk);
                    Handle::new(u64::from_le_bytes(word))
                })
                .collect())
        };
        let degree = self.degree as u64;
        match kind {
            KIND_LEAF if count <= degree => Ok(Node::Leaf(words(0, count)?)),
            KIND_INNER if (1..=degree).contains(&count) => Ok(Node::Inner {
                separators: words(0, count - 1)?,
                children: words(degree - 1, count)?,
            }),
            _ => Err(CoreError::corrupt(format!(
                "stree node {handle} has kind {kind} and count {count}"
            ))),
        }
    }

    fn published_root(&self) -> Handle {
        Handle::new(self.root.load(Ordering::Acquire))
    }

    /// Position of `key` among a leaf's records.
    fn search(&self, records: &[Handle], key: &[u8]) -> CoreResult<Result<usize, usize>> {
        let (mut lo, mut hi) = (0, records.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            match record::compare_key(&self.pool, records[mid], key)? {
                KeyOrdering::Less => lo = mid + 1,
                KeyOrdering::Greater => hi = mid,
                KeyOrdering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Index of the child that holds `key`: the number of separators `<= key`.
    fn child_index(&self, separators: &[Handle], key: &[u8]) -> CoreResult<usize> {
        let (mut lo, mut hi) = (0, separators.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if record::compare_key(&self.pool, separators[mid], key)? == KeyOrdering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    fn insert_below(
        &self,
        tx: &mut Transaction<'_>,
        at: Handle,
        key: &[u8],
        record: Handle,
    ) -> CoreResult<Inserted> {
        let node = self.read_node(at)?;
        tx.free(at)?;
        match node {
            Node::Leaf(mut records) => match self.search(&records, key)? {
                Ok(i) => {
                    let old = std::mem::replace(&mut records[i], record);
                    let node = write_node(tx, self.degree, &Node::Leaf(records))?;
                    Ok(Inserted::Replaced { node, old })
                }
                Err(i) => {
                    records.insert(i, record);
                    if records.len() <= self.degree {
                        return Ok(Inserted::Added(write_node(
                            tx,
                            self.degree,
                            &Node::Leaf(records),
                        )?));
                    }
                    let right = records.split_off(records.len() / 2);
                    let first = record::read_key(&self.pool, right[0])?;
                    let separator = record::create(tx, &first, &[])?;
                    Ok(Inserted::Split {
                        left: write_node(tx, self.degree, &Node::Leaf(records))?,
                        separator,
                        right: write_node(tx, self.degree, &Node::Leaf(right))?,
                    })
                }
            },
            Node::Inner {
                mut separators,
                mut children,
            } => {
                let i = self.child_index(&separators, key)?;
                match self.insert_below(tx, children[i], key, record)? {
                    Inserted::Replaced { node, old } => {
                        children[i] = node;
                        let node = write_node(
                            tx,
                            self.degree,
                            &Node::Inner {
                                separators,
                                children,
                            },
                        )?;
                        Ok(Inserted::Replaced { node, old })
                    }
                    Inserted::Added(node) => {
                        children[i] = node;
                        Ok(Inserted::Added(write_node(
                            tx,
                            self.degree,
                            &Node::Inner {
                                separators,
                                children,
                            },
                        )?))
                    }
                    Inserted::Split {
                        left,
                        separator,
                        right,
                    } => {
                        children[i] = left;
                        children.insert(i + 1, right);
                        separators.insert(i, separator);
                        if children.len() <= self.degree {
                            return Ok(Inserted::Added(write_node(
                                tx,
                                self.degree,
                                &Node::Inner {
                                    separators,
                                    children,
                                },
                            )?));
                        }
                        let mid = separators.len() / 2;
                        let right_separators = separators.split_off(mid + 1);
                        let promoted = separators.pop().ok_or_else(|| {
                            CoreError::corrupt("stree inner split without separators")
                        })?;
                        let right_children = children.split_off(mid + 1);
                        Ok(Inserted::Split {
                            left: write_node(
                                tx,
                                self.degree,
                                &Node::Inner {
                                    separators,
                                    children,
                                },
                            )?,
                            separator: promoted,
                            right: write_node(
                                tx,
                                self.degree,
                                &Node::Inner {
                                    separators: right_separators,
                                    children: right_children,
                                },
                            )?,
                        })
                    }
                }
            }
        }
    }

    fn erase_below(
        &self,
        tx: &mut Transaction<'_>,
        at: Handle,
        key: &[u8],
    ) -> CoreResult<Option<(Erased, Handle)>> {
        match self.read_node(at)? {
            Node::Leaf(mut records) => {
                let Ok(i) = self.search(&records, key)? else {
                    return Ok(None);
                };
                tx.free(at)?;
                let old = records.remove(i);
                if records.is_empty() {
                    return Ok(Some((Erased::Empty, old)));
                }
                let node = write_node(tx, self.degree, &Node::Leaf(records))?;
                Ok(Some((Erased::Node(node), old)))
            }
            Node::Inner {
                mut separators,
                mut children,
            } => {
                let i = self.child_index(&separators, key)?;
                let Some((erased, old)) = self.erase_below(tx, children[i], key)? else {
                    return Ok(None);
                };
                tx.free(at)?;
                match erased {
                    Erased::Node(node) => children[i] = node,
                    Erased::Empty => {
                        children.remove(i);
                        if children.is_empty() {
                            return Ok(Some((Erased::Empty, old)));
                        }
                        let separator = separators.remove(i.saturating_sub(1));
                        tx.free(separator)?;
                    }
                }
                let node = write_node(
                    tx,
                    self.degree,
                    &Node::Inner {
                        separators,
                        children,
                    },
                )?;
                Ok(Some((Erased::Node(node), old)))
            }
        }
    }

    /// Points the root block at `root` and publishes it after commit.
    fn set_root<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        root: Handle,
        delta: i64,
    ) -> CoreResult<()> {
        tx.write_u64(self.root_block.at(8), root.as_u64())?;
        let (publish, published, count) = (&self.publish, &self.root, &self.count);
        tx.on_commit(move || {
            let _readers_gone = publish.write();
            published.store(root.as_u64(), Ordering::Release);
            match delta {
                1 => count.fetch_add(1, Ordering::Relaxed),
                -1 => count.fetch_sub(1, Ordering::Relaxed),
                _ => count.load(Ordering::Relaxed),
            };
        });
        Ok(())
    }

    /// Collects up to `SCAN_BATCH` entries of `range` in key order.
    fn collect(&self, range: &KeyRange<'_>, mode: ScanMode) -> CoreResult<Vec<Entry>> {
        let _published = self.publish.read();
        let mut out = Vec::new();
        self.collect_below(self.published_root(), range, mode, &mut out)?;
        Ok(out)
    }

    /// Returns false once the batch is full or the upper bound was passed.
    fn collect_below(
        &self,
        at: Handle,
        range: &KeyRange<'_>,
        mode: ScanMode,
        out: &mut Vec<Entry>,
    ) -> CoreResult<bool> {
        match self.read_node(at)? {
            Node::Leaf(records) => {
                let start = match range.lower {
                    Bound::Unbounded => 0,
                    Bound::Included(low) | Bound::Excluded(low) => {
                        self.search(&records, low)?.unwrap_or_else(|i| i)
                    }
                };
                for record in &records[start..] {
                    let entry = read_entry(&self.pool, *record, mode)?;
                    if !range.before_upper(&entry.0) {
                        return Ok(false);
                    }
                    if range.after_lower(&entry.0) {
                        out.push(entry);
                        if out.len() >= SCAN_BATCH {
                            return Ok(false);
                        }
                    }
                }
                Ok(true)
            }
            Node::Inner {
                separators,
                children,
            } => {
                let start = match range.lower {
                    Bound::Unbounded => 0,
                    Bound::Included(low) | Bound::Excluded(low) => {
                        self.child_index(&separators, low)?
                    }
                };
                for child in &children[start..] {
                    if !self.collect_below(*child, range, mode, out)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Sums leaf sizes, checking that every leaf sits at the same depth.
    fn count_entries(
        &self,
        at: Handle,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> CoreResult<u64> {
        match self.read_node(at)? {
            Node::Leaf(records) => {
                if *leaf_depth.get_or_insert(depth) != depth {
                    return Err(CoreError::corrupt(format!(
                        "stree leaf {at} at depth {depth} breaks balance"
                    )));
                }
                Ok(records.len() as u64)
            }
            Node::Inner { children, .. } => {
                let mut sum = 0;
                for child in children {
                    sum += self.count_entries(child, depth + 1, leaf_depth)?;
                }
                Ok(sum)
            }
        }
    }

    /// Checks key order against the bounds inherited from the parents.
    fn verify_below(
        &self,
        at: Handle,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        is_root: bool,
    ) -> CoreResult<u64> {
        let in_bounds =
            |key: &[u8]| low.is_none_or(|low| key >= low) && high.is_none_or(|high| key < high);
        match self.read_node(at)? {
            Node::Leaf(records) => {
                if records.is_empty() && !is_root {
                    return Err(CoreError::corrupt(format!("stree leaf {at} is empty")));
                }
                let mut previous: Option<Vec<u8>> = None;
                for record in &records {
                    record::verify(&self.pool, *record)?;
                    let key = record::read_key(&self.pool, *record)?;
                    if !in_bounds(&key) || previous.as_ref().is_some_and(|prev| *prev >= key) {
                        return Err(CoreError::corrupt(format!(
                            "stree leaf {at} holds record {record} out of order"
                        )));
                    }
                    previous = Some(key);
                }
                Ok(records.len() as u64)
            }
            Node::Inner {
                separators,
                children,
            } => {
                let keys = separators
                    .iter()
                    .map(|separator| {
                        record::verify(&self.pool, *separator)?;
                        record::read_key(&self.pool, *separator)
                    })
                    .collect::<CoreResult<Vec<_>>>()?;
                let ordered = keys.windows(2).all(|pair| pair[0] < pair[1]);
                if !ordered || !keys.iter().all(|key| in_bounds(key)) {
                    return Err(CoreError::corrupt(format!(
                        "stree node {at} has separators out of order"
                    )));
                }
                let mut sum = 0;
                for (i, child) in children.iter().enumerate() {
                    let child_low = if i == 0 { low } else { Some(keys[i - 1].as_slice()) };
                    let child_high = keys.get(i).map(Vec::as_slice).or(high);
                    sum += self.verify_below(*child, child_low, child_high, false)?;
                }
                Ok(sum)
            }
        }
    }
}

impl Index for STree {
    fn kind(&self) -> EngineKind {
        EngineKind::STree
    }

    fn read_guard(&self, _key: &[u8]) -> IndexGuard<'_> {
        IndexGuard::Shared(self.publish.read())
    }

    fn write_guard(&self, _key: &[u8]) -> IndexGuard<'_> {
        IndexGuard::Writer(self.writer.lock())
    }

    fn find(&self, _guard: &IndexGuard<'_>, key: &[u8]) -> CoreResult<Option<Handle>> {
        let mut at = self.published_root();
        loop {
            match self.read_node(at)? {
                Node::Inner {
                    separators,
                    children,
                } => at = children[self.child_index(&separators, key)?],
                Node::Leaf(records) => {
                    return Ok(self.search(&records, key)?.ok().map(|i| records[i]));
                }
            }
        }
    }

    fn insert<'a>(
        &'a self,
        _guard: &IndexGuard<'_>,
        tx: &mut Transaction<'a>,
        key: &[u8],
        record: Handle,
    ) -> CoreResult<Option<Handle>> {
        match self.insert_below(tx, self.published_root(), key, record)? {
            Inserted::Replaced { node, old } => {
                self.set_root(tx, node, 0)?;
                Ok(Some(old))
            }
            Inserted::Added(node) => {
                self.set_root(tx, node, 1)?;
                Ok(None)
            }
            Inserted::Split {
                left,
                separator,
                right,
            } => {
                let root = write_node(
                    tx,
                    self.degree,
                    &Node::Inner {
                        separators: vec![separator],
                        children: vec![left, right],
                    },
                )?;
                self.set_root(tx, root, 1)?;
                Ok(None)
            }
        }
    }

    fn erase<'a>(
        &'a self,
        _guard: &IndexGuard<'_>,
        tx: &mut Transaction<'a>,
        key: &[u8],
    ) -> CoreResult<Option<Handle>> {
        let Some((erased, old)) = self.erase_below(tx, self.published_root(), key)? else {
            return Ok(None);
        };
        let mut root = match erased {
            Erased::Node(node) => node,
            Erased::Empty => write_node(tx, self.degree, &Node::Leaf(Vec::new()))?,
        };
        while let Node::Inner { children, .. } = self.read_node(root)? {
            if children.len() != 1 {
                break;
            }
            tx.free(root)?;
            root = children[0];
        }
        self.set_root(tx, root, -1)?;
        Ok(Some(old))
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
        let _published = self.publish.read();
        let root = self.published_root();
        let persisted = self.pool.media().read_u64(self.root_block.at(8))?;
        if persisted != root.as_u64() {
            return Err(CoreError::corrupt(format!(
                "stree root block points at {persisted:#x}, published root is {root}"
            )));
        }
        self.count_entries(root, 0, &mut None)?;
        let found = self.verify_below(root, None, None, true)?;
        if found != self.count() {
            return Err(CoreError::corrupt(format!(
                "stree holds {found} entries but counts {}",
                self.count()
            )));
        }
        Ok(found)
    }
}
