//! Region trait definition.

use crate::error::PmemResult;
use std::path::Path;
use std::sync::Arc;

/// Chunk size used when filling large ranges.
const FILL_CHUNK: usize = 64 * 1024;

/// A fixed-size, byte-addressable persistent memory region.
///
/// Regions are **opaque byte areas**. pmkv owns the interpretation of every
/// byte: pool headers, undo lanes, heap blocks and index nodes all live
/// above this trait.
///
/// # Invariants
///
/// - `read_at` returns the bytes most recently written at that offset
/// - bytes covered by a successful `persist` survive process termination
/// - accesses outside `0..len()` fail with `OutOfBounds` and touch nothing
/// - regions must be `Send + Sync`; callers serialize overlapping writes
///
/// # Implementors
///
/// - [`crate::MappedRegion`] - memory-mapped file
/// - [`crate::VolatileRegion`] - anonymous memory
pub trait PersistentMemory: Send + Sync {
    /// Returns the size of the region in bytes.
    fn len(&self) -> u64;

    /// Returns true if the region has no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `buf.len()` bytes starting at `offset` into `buf`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfBounds` if the range leaves the region.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> PmemResult<()>;

    /// Writes `data` at `offset`.
    ///
    /// The write is visible to later reads immediately but is only durable
    /// after a `persist` that covers it.
    ///
    /// # Errors
    ///
    /// Returns `OutOfBounds` if the range leaves the region, or an I/O error
    /// from regions that can fail writes.
    fn write_at(&self, offset: u64, data: &[u8]) -> PmemResult<()>;

    /// Makes `len` bytes starting at `offset` durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds or the flush fails.
    fn persist(&self, offset: u64, len: u64) -> PmemResult<()>;

    /// Makes the whole region durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn persist_all(&self) -> PmemResult<()> {
        self.persist(0, self.len())
    }

    /// Returns true if persisted bytes survive the process.
    fn is_durable(&self) -> bool;

    /// Returns the backing file, if any.
    fn path(&self) -> Option<&Path> {
        None
    }

    /// Reads `len` bytes at `offset` into a new vector.
    ///
    /// # Errors
    ///
    /// Returns `OutOfBounds` if the range leaves the region.
    fn read_vec(&self, offset: u64, len: usize) -> PmemResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Reads a little-endian `u64` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfBounds` if the word leaves the region.
    fn read_u64(&self, offset: u64) -> PmemResult<u64> {
        let mut buf = [0u8; 8];
        self.read_at(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Writes a little-endian `u64` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfBounds` if the word leaves the region.
    fn write_u64(&self, offset: u64, value: u64) -> PmemResult<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Reads a little-endian `u32` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfBounds` if the word leaves the region.
    fn read_u32(&self, offset: u64) -> PmemResult<u32> {
        let mut buf = [0u8; 4];
        self.read_at(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Sets `len` bytes starting at `offset` to `byte`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfBounds` if the range leaves the region.
    fn fill(&self, offset: u64, len: u64, byte: u8) -> PmemResult<()> {
        let chunk = vec![byte; FILL_CHUNK.min(len as usize)];
        let mut done = 0u64;
        while done < len {
            let n = (len - done).min(chunk.len() as u64) as usize;
            self.write_at(offset + done, &chunk[..n])?;
            done += n as u64;
        }
        Ok(())
    }
}

impl<T: PersistentMemory + ?Sized> PersistentMemory for Arc<T> {
    fn len(&self) -> u64 {
        (**self).len()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> PmemResult<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> PmemResult<()> {
        (**self).write_at(offset, data)
    }

    fn persist(&self, offset: u64, len: u64) -> PmemResult<()> {
        (**self).persist(offset, len)
    }

    fn persist_all(&self) -> PmemResult<()> {
        (**self).persist_all()
    }

    fn is_durable(&self) -> bool {
        (**self).is_durable()
    }

    fn path(&self) -> Option<&Path> {
        (**self).path()
    }
}

impl<T: PersistentMemory + ?Sized> PersistentMemory for Box<T> {
    fn len(&self) -> u64 {
        (**self).len()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> PmemResult<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> PmemResult<()> {
        (**self).write_at(offset, data)
    }

    fn persist(&self, offset: u64, len: u64) -> PmemResult<()> {
        (**self).persist(offset, len)
    }

    fn persist_all(&self) -> PmemResult<()> {
        (**self).persist_all()
    }

    fn is_durable(&self) -> bool {
        (**self).is_durable()
    }

    fn path(&self) -> Option<&Path> {
        (**self).path()
    }
}
