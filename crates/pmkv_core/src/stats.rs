//! Store statistics.
//!
//! ```rust,ignore
//! let store = Store::open_volatile(EngineKind::Radix, 64 << 20)?;
//! store.put(b"k", b"v")?;
//!
//! let stats = store.stats()?;
//! println!("writes: {}, heap used: {}", stats.writes, stats.heap.used_bytes);
//! ```

use crate::heap::HeapStats;
use crate::types::EngineKind;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counters of an open store.
///
/// All counters are atomic and may be read while operations run.
#[derive(Debug, Default)]
pub(crate) struct StoreCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    removes: AtomicU64,
    scans: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl StoreCounters {
    pub(crate) fn record_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_scan(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
    }
}

/// A point-in-time snapshot of store statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Engine of the store.
    pub engine: EngineKind,
    /// Committed entries.
    pub entries: u64,
    /// Point reads since open.
    pub reads: u64,
    /// Puts since open.
    pub writes: u64,
    /// Removes of existing keys since open.
    pub removes: u64,
    /// Iterations and range queries since open.
    pub scans: u64,
    /// Value bytes returned by point reads.
    pub bytes_read: u64,
    /// Key and value bytes written by puts.
    pub bytes_written: u64,
    /// Committed transactions since open.
    pub commits: u64,
    /// Aborted transactions since open.
    pub aborts: u64,
    /// Allocator state.
    pub heap: HeapStats,
}

impl StoreStats {
    pub(crate) fn collect(
        engine: EngineKind,
        entries: u64,
        counters: &StoreCounters,
        commits: u64,
        aborts: u64,
        heap: HeapStats,
    ) -> Self {
        Self {
            engine,
            entries,
            reads: counters.reads.load(Ordering::Relaxed),
            writes: counters.writes.load(Ordering::Relaxed),
            removes: counters.removes.load(Ordering::Relaxed),
            scans: counters.scans.load(Ordering::Relaxed),
            bytes_read: counters.bytes_read.load(Ordering::Relaxed),
            bytes_written: counters.bytes_written.load(Ordering::Relaxed),
            commits,
            aborts,
            heap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let counters = StoreCounters::default();
        counters.record_read(10);
        counters.record_read(5);
        counters.record_write(7);
        counters.record_remove();
        counters.record_scan();

        let stats = StoreStats::collect(
            EngineKind::CMap,
            3,
            &counters,
            4,
            1,
            HeapStats::default(),
        );
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.bytes_read, 15);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.bytes_written, 7);
        assert_eq!(stats.removes, 1);
        assert_eq!(stats.scans, 1);
        assert_eq!(stats.commits, 4);
    }

    #[test]
    fn snapshot_serializes() {
        let stats = StoreStats::collect(
            EngineKind::STree,
            0,
            &StoreCounters::default(),
            0,
            0,
            HeapStats::default(),
        );
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["engine"], "stree");
        assert_eq!(json["heap"]["used_blocks"], 0);
    }
}
