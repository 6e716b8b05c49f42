//! Persistent heap allocator.
//!
//! The heap is a chain of blocks carved from the front of the heap area:
//!
//! ```text
//! [size u64 | state u64 | payload ...][size | state | payload ...]...[0 | 0]
//! ```
//!
//! `size` is the whole block including its 16 byte header and is a multiple
//! of 64. `state` is [`BLOCK_FREE`] or [`BLOCK_USED`]. The chain ends at the
//! first zeroed header, the start of the never-carved tail ("wilderness").
//!
//! Only the block headers are persistent. The free index is volatile and is
//! rebuilt at open by walking the chain, so allocator state never needs its
//! own log. Flipping a header between FREE and USED is what a transaction
//! logs; see [`crate::transaction::Transaction::alloc`].
//!
//! Adjacent free blocks are not coalesced. A freed block is reused for
//! requests of its own size class first and as a best fit once the
//! wilderness is exhausted.

use crate::error::{CoreError, CoreResult};
use crate::pool::media::Media;
use crate::types::Handle;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;

/// Bytes of header in front of every payload.
pub(crate) const BLOCK_HEADER: u64 = 16;

/// Header state of a reusable block.
pub(crate) const BLOCK_FREE: u64 = 0x4545_5246_4b43_4c42;

/// Header state of an allocated block.
pub(crate) const BLOCK_USED: u64 = 0x4445_5355_4b43_4c42;

/// Smallest block size.
pub(crate) const MIN_BLOCK: u64 = 64;

/// Largest power-of-two size class.
const MAX_CLASS: u64 = 256 * 1024;

/// Granularity of blocks above `MAX_CLASS`.
const LARGE_UNIT: u64 = 64 * 1024;

/// Returns the block size that serves a payload of `payload` bytes.
pub(crate) fn block_size_for(payload: u64) -> Option<u64> {
    let total = payload.checked_add(BLOCK_HEADER)?;
    if total <= MAX_CLASS {
        Some(total.next_power_of_two().max(MIN_BLOCK))
    } else {
        let units = total.checked_add(LARGE_UNIT - 1)? / LARGE_UNIT;
        units.checked_mul(LARGE_UNIT)
    }
}

/// A block in the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    /// Region offset of the block header.
    pub offset: u64,
    /// Total block size.
    pub size: u64,
}

impl Block {
    pub(crate) const fn handle(self) -> Handle {
        Handle::new(self.offset + BLOCK_HEADER)
    }

    pub(crate) const fn state_offset(self) -> u64 {
        self.offset + 8
    }

    pub(crate) const fn capacity(self) -> u64 {
        self.size - BLOCK_HEADER
    }
}

/// Allocator statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    /// Size of the heap area.
    pub heap_size: u64,
    /// Bytes in blocks that are allocated or reserved by a transaction.
    pub used_bytes: u64,
    /// Number of allocated or reserved blocks.
    pub used_blocks: u64,
    /// Bytes in free blocks awaiting reuse.
    pub free_bytes: u64,
    /// Number of free blocks awaiting reuse.
    pub free_blocks: u64,
    /// Bytes never carved.
    pub wilderness_bytes: u64,
}

#[derive(Debug)]
struct HeapState {
    top: u64,
    free: BTreeMap<u64, Vec<u64>>,
    stats: HeapStats,
}

impl HeapState {
    fn take(&mut self, size: u64, best_fit: bool) -> Option<Block> {
        let found = match best_fit {
            true => self.free.range(size..).next().map(|(size, _)| *size),
            false => self.free.contains_key(&size).then_some(size),
        }?;
        let offsets = self.free.get_mut(&found)?;
        let offset = offsets.pop()?;
        if offsets.is_empty() {
            self.free.remove(&found);
        }
        self.stats.free_bytes -= found;
        self.stats.free_blocks -= 1;
        Some(Block {
            offset,
            size: found,
        })
    }

    fn put_free(&mut self, block: Block) {
        self.free.entry(block.size).or_default().push(block.offset);
        self.stats.free_bytes += block.size;
        self.stats.free_blocks += 1;
    }
}

/// The volatile side of the allocator.
#[derive(Debug)]
pub(crate) struct Heap {
    start: u64,
    end: u64,
    state: Mutex<HeapState>,
}

impl Heap {
    /// Formats an empty heap over `start..end`.
    pub(crate) fn format(media: &Media, start: u64, end: u64) -> CoreResult<Self> {
        media.write(start, &[0u8; BLOCK_HEADER as usize])?;
        media.persist(start, BLOCK_HEADER)?;
        Ok(Self::with_top(start, end, start, BTreeMap::new(), 0, 0))
    }

    /// Rebuilds the free index by walking the block chain.
    ///
    /// # Errors
    ///
    /// Returns `CorruptMetadata` for a header with an impossible size or an
    /// unknown state.
    pub(crate) fn recover(media: &Media, start: u64, end: u64) -> CoreResult<Self> {
        let mut free: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        let mut used_bytes = 0u64;
        let mut used_blocks = 0u64;
        let mut offset = start;

        while offset + BLOCK_HEADER <= end {
            let size = media.read_u64(offset)?;
            let state = media.read_u64(offset + 8)?;
            if size == 0 && state == 0 {
                break;
            }
            if size < MIN_BLOCK || size % MIN_BLOCK != 0 || size > end - offset {
                return Err(CoreError::corrupt(format!(
                    "heap block at {offset:#x} has invalid size {size}"
                )));
            }
            match state {
                BLOCK_FREE => free.entry(size).or_default().push(offset),
                BLOCK_USED => {
                    used_bytes += size;
                    used_blocks += 1;
                }
                other => {
                    return Err(CoreError::corrupt(format!(
                        "heap block at {offset:#x} has invalid state {other:#x}"
                    )))
                }
            }
            offset += size;
        }

        let heap = Self::with_top(start, end, offset, free, used_bytes, used_blocks);
        let stats = heap.stats();
        tracing::debug!(
            used_blocks = stats.used_blocks,
            free_blocks = stats.free_blocks,
            wilderness = stats.wilderness_bytes,
            "heap walk complete"
        );
        Ok(heap)
    }

    fn with_top(
        start: u64,
        end: u64,
        top: u64,
        free: BTreeMap<u64, Vec<u64>>,
        used_bytes: u64,
        used_blocks: u64,
    ) -> Self {
        let free_blocks = free.values().map(|v| v.len() as u64).sum();
        let free_bytes = free.iter().map(|(size, v)| size * v.len() as u64).sum();
        Self {
            start,
            end,
            state: Mutex::new(HeapState {
                top,
                free,
                stats: HeapStats {
                    heap_size: end - start,
                    used_bytes,
                    used_blocks,
                    free_bytes,
                    free_blocks,
                    wilderness_bytes: 0,
                },
            }),
        }
    }

    /// Reserves a FREE block able to hold `payload` bytes.
    ///
    /// The block's persistent header still says FREE; the caller's
    /// transaction flips it. The block either stays allocated once that
    /// transaction commits or comes back through [`Heap::release`].
    ///
    /// # Errors
    ///
    /// Returns `OutOfSpace` when no free block or wilderness fits.
    pub(crate) fn reserve(&self, media: &Media, payload: u64) -> CoreResult<Block> {
        let size =
            block_size_for(payload).ok_or(CoreError::OutOfSpace { requested: payload })?;
        let mut state = self.state.lock();

        let block = if let Some(block) = state.take(size, false) {
            block
        } else if size <= self.end - state.top {
            let block = Block {
                offset: state.top,
                size,
            };
            self.carve(media, block)?;
            state.top += size;
            block
        } else if let Some(block) = state.take(size, true) {
            block
        } else {
            return Err(CoreError::OutOfSpace { requested: payload });
        };

        state.stats.used_bytes += block.size;
        state.stats.used_blocks += 1;
        Ok(block)
    }

    /// Writes the header of a block cut from the wilderness.
    fn carve(&self, media: &Media, block: Block) -> CoreResult<()> {
        // keep the chain terminated before the new header appears
        let next = block.offset + block.size;
        if next + BLOCK_HEADER <= self.end {
            media.write(next, &[0u8; BLOCK_HEADER as usize])?;
            media.persist(next, BLOCK_HEADER)?;
        }
        let mut header = [0u8; BLOCK_HEADER as usize];
        header[..8].copy_from_slice(&block.size.to_le_bytes());
        header[8..].copy_from_slice(&BLOCK_FREE.to_le_bytes());
        media.write(block.offset, &header)?;
        media.persist(block.offset, BLOCK_HEADER)
    }

    /// Returns a block to the free index.
    pub(crate) fn release(&self, block: Block) {
        let mut state = self.state.lock();
        state.stats.used_bytes -= block.size;
        state.stats.used_blocks -= 1;
        state.put_free(block);
    }

    /// Resolves a handle to its block and checks the header.
    ///
    /// # Errors
    ///
    /// Returns `CorruptMetadata` if the handle lies outside the heap or its
    /// header is not USED.
    pub(crate) fn block_of(&self, media: &Media, handle: Handle) -> CoreResult<Block> {
        self.check_handle(handle)?;
        let offset = handle.as_u64() - BLOCK_HEADER;
        let size = media.read_u64(offset)?;
        let state = media.read_u64(offset + 8)?;
        if state != BLOCK_USED || size < MIN_BLOCK || size > self.end - offset {
            return Err(CoreError::corrupt(format!(
                "handle {handle} does not name an allocated block"
            )));
        }
        Ok(Block { offset, size })
    }

    /// Checks that a handle could name a payload in this heap.
    pub(crate) fn check_handle(&self, handle: Handle) -> CoreResult<()> {
        let raw = handle.as_u64();
        let aligned = raw >= self.start + BLOCK_HEADER
            && (raw - BLOCK_HEADER - self.start) % MIN_BLOCK == 0
            && raw < self.end;
        if !aligned {
            return Err(CoreError::corrupt(format!(
                "handle {handle} lies outside the heap"
            )));
        }
        Ok(())
    }

    /// Walks the chain again and compares it with the volatile accounting.
    pub(crate) fn verify(&self, media: &Media) -> CoreResult<()> {
        let walked = Self::recover(media, self.start, self.end)?.stats();
        let current = self.stats();
        if walked.used_blocks != current.used_blocks || walked.free_blocks != current.free_blocks
        {
            return Err(CoreError::corrupt(format!(
                "heap accounting drifted: walk found {} used / {} free blocks, index has {} / {}",
                walked.used_blocks, walked.free_blocks, current.used_blocks, current.free_blocks
            )));
        }
        Ok(())
    }

    /// Returns current statistics.
    pub(crate) fn stats(&self) -> HeapStats {
        let state = self.state.lock();
        HeapStats {
            wilderness_bytes: self.end - state.top,
            ..state.stats
        }
    }
}
