//! Lane assignment.

use super::lane::Lane;
use crate::error::CoreResult;
use crate::pool::header::PoolHeader;
use crate::pool::media::Media;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Hands lanes to transactions.
///
/// A transaction holds its lane's mutex from begin to commit or abort, so
/// the number of lanes bounds the number of concurrent transactions. A
/// caller that finds every lane busy blocks on one of them.
#[derive(Debug)]
pub(crate) struct LaneManager {
    lanes: Vec<Mutex<Lane>>,
    next: AtomicUsize,
    next_txid: AtomicU64,
}

impl LaneManager {
    pub(crate) fn new(header: &PoolHeader) -> Self {
        let size = u64::from(header.lane_size);
        let lanes = (0..header.lane_count)
            .map(|index| {
                let offset = header.lanes_offset() + u64::from(index) * size;
                Mutex::new(Lane::new(index, offset, size))
            })
            .collect();
        Self {
            lanes,
            next: AtomicUsize::new(0),
            next_txid: AtomicU64::new(1),
        }
    }

    /// Writes empty headers into every lane.
    pub(crate) fn format(&self, media: &Media) -> CoreResult<()> {
        for lane in &self.lanes {
            lane.lock().format(media)?;
        }
        Ok(())
    }

    /// Rolls back every lane a crash left active.
    ///
    /// Returns the number of lanes rolled back.
    pub(crate) fn recover(&self, media: &Media) -> CoreResult<usize> {
        let mut rolled_back = 0;
        for lane in &self.lanes {
            if lane.lock().recover(media)?.is_some() {
                rolled_back += 1;
            }
        }
        Ok(rolled_back)
    }

    /// Takes a free lane, blocking if all are in use.
    pub(crate) fn acquire(&self) -> MutexGuard<'_, Lane> {
        let start = self.next.fetch_add(1, Ordering::Relaxed) % self.lanes.len();
        for step in 0..self.lanes.len() {
            let index = (start + step) % self.lanes.len();
            if let Some(guard) = self.lanes[index].try_lock() {
                return guard;
            }
        }
        self.lanes[start].lock()
    }

    pub(crate) fn next_txid(&self) -> u64 {
        self.next_txid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn len(&self) -> usize {
        self.lanes.len()
    }
}
