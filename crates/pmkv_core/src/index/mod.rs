//! Index structures.
//!
//! An index maps keys to record handles. Its structural metadata lives in
//! the pool and is only modified through a [`Transaction`]; volatile state
//! such as the entry count is published through commit hooks so that it
//! only ever reflects committed data.
//!
//! Callers take a guard for the key before touching the index and hold it
//! across the whole transaction. The guard is what serializes conflicting
//! operations; the index methods take it only as proof.

pub(crate) mod cmap;
pub(crate) mod radix;
pub(crate) mod stree;

use crate::error::CoreResult;
use crate::iter::{KeyRange, ScanMode, Visitor};
use crate::pool::Pool;
use crate::transaction::Transaction;
use crate::types::{EngineKind, Handle};
use parking_lot::{MutexGuard, RwLockReadGuard, RwLockWriteGuard};
use std::ops::ControlFlow;

/// Proof that the caller holds the lock covering a key.
#[derive(Debug)]
pub(crate) enum IndexGuard<'a> {
    /// Shared lock; readers.
    Shared(RwLockReadGuard<'a, ()>),
    /// Exclusive lock; writers of engines that update in place.
    Exclusive(RwLockWriteGuard<'a, ()>),
    /// Writer lock of a copy-on-write engine; readers are not blocked.
    Writer(MutexGuard<'a, ()>),
}

/// Operations every engine provides.
pub(crate) trait Index: Send + Sync {
    /// Returns the engine kind.
    fn kind(&self) -> EngineKind;

    /// Returns true if scans follow key order and accept bounds.
    fn is_ordered(&self) -> bool {
        self.kind().is_ordered()
    }

    /// Takes the lock readers of `key` need.
    fn read_guard(&self, key: &[u8]) -> IndexGuard<'_>;

    /// Takes the lock writers of `key` need.
    fn write_guard(&self, key: &[u8]) -> IndexGuard<'_>;

    /// Looks up the record of `key`.
    fn find(&self, guard: &IndexGuard<'_>, key: &[u8]) -> CoreResult<Option<Handle>>;

    /// Links `record` under `key`, returning the record it replaced.
    ///
    /// The replaced record is not freed; that is the caller's job.
    fn insert<'a>(
        &'a self,
        guard: &IndexGuard<'_>,
        tx: &mut Transaction<'a>,
        key: &[u8],
        record: Handle,
    ) -> CoreResult<Option<Handle>>;

    /// Unlinks `key`, returning its record. The record is not freed.
    fn erase<'a>(
        &'a self,
        guard: &IndexGuard<'_>,
        tx: &mut Transaction<'a>,
        key: &[u8],
    ) -> CoreResult<Option<Handle>>;

    /// Returns the number of committed entries.
    fn count(&self) -> u64;

    /// Visits the entries inside `range`.
    ///
    /// Unordered engines accept only the full range.
    fn scan(
        &self,
        range: &KeyRange<'_>,
        mode: ScanMode,
        visitor: &mut Visitor<'_>,
    ) -> CoreResult<ControlFlow<()>>;

    /// Walks the whole structure, checking links, ordering and record
    /// checksums. Returns the number of entries found.
    fn verify(&self) -> CoreResult<u64>;
}

/// Reads the record at `handle` in the shape `mode` asks for.
pub(crate) fn read_entry(
    pool: &Pool,
    handle: Handle,
    mode: ScanMode,
) -> CoreResult<(Vec<u8>, Vec<u8>)> {
    match mode {
        ScanMode::Pairs => crate::record::read_pair(pool, handle),
        ScanMode::KeysOnly => Ok((crate::record::read_key(pool, handle)?, Vec::new())),
    }
}

/// Checks the magic word at the start of an engine root block.
pub(crate) fn check_root(
    pool: &Pool,
    root: Handle,
    magic: u64,
    engine: EngineKind,
) -> CoreResult<()> {
    let found = pool.media().read_u64(root.as_u64())?;
    if found != magic {
        return Err(crate::error::CoreError::corrupt(format!(
            "{engine} root block {root} has magic {found:#x}"
        )));
    }
    Ok(())
}

/// Writes `len` zero bytes at `offset` inside a block the transaction allocated.
pub(crate) fn zero_fresh(tx: &mut Transaction<'_>, offset: u64, len: u64) -> CoreResult<()> {
    const CHUNK: u64 = 64 * 1024;
    let zeros = vec![0u8; CHUNK.min(len) as usize];
    let mut done = 0;
    while done < len {
        let n = (len - done).min(CHUNK);
        tx.write(offset + done, &zeros[..n as usize])?;
        done += n;
    }
    Ok(())
}
